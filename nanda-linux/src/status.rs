//! Connectivity status shared with the display collaborator.

use std::sync::Arc;

use nanda_core::ConnectivityStatus;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct StatusHandle(Arc<watch::Sender<ConnectivityStatus>>);

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectivityStatus::default());
        Self(Arc::new(tx))
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.0.subscribe()
    }

    pub fn current(&self) -> ConnectivityStatus {
        self.0.borrow().clone()
    }

    /// Apply `f`; subscribers are woken only if the status actually changed.
    pub fn update(&self, f: impl FnOnce(&mut ConnectivityStatus)) {
        self.0.send_if_modified(|s| {
            let before = s.clone();
            f(s);
            *s != before
        });
    }
}

/// Log every status change until the handle is dropped.
pub async fn log_changes(mut rx: watch::Receiver<ConnectivityStatus>) {
    while rx.changed().await.is_ok() {
        let s = rx.borrow_and_update().clone();
        info!(
            registry = s.registry_url.as_deref().unwrap_or("-"),
            registration = ?s.registration,
            tunnel = ?s.tunnel,
            peers = s.peer_count,
            standalone = s.is_standalone(),
            "status"
        );
    }
}
