//! Runs the local request executor off the async runtime with a time bound.

use std::sync::Arc;
use std::time::Duration;

use nanda_core::{ExecutorResponse, LocalRequestExecutor};
use tracing::warn;

pub type SharedExecutor = Arc<dyn LocalRequestExecutor>;

/// Execute on the blocking pool. A call that overruns `timeout`, or panics, yields a
/// synthetic error body echoing the path instead of stalling the caller.
pub async fn execute_bounded(
    executor: SharedExecutor,
    method: String,
    path: String,
    body: String,
    timeout: Duration,
) -> ExecutorResponse {
    let p = path.clone();
    let task = tokio::task::spawn_blocking(move || executor.execute(&method, &p, &body));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(%path, error = %e, "executor failed");
            ExecutorResponse::error(500, "Executor failed", &path)
        }
        Err(_) => {
            warn!(%path, ?timeout, "executor timed out");
            ExecutorResponse::error(504, "Executor timeout", &path)
        }
    }
}
