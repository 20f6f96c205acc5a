//! Registration Client: register with the active endpoint and keep liveness.

use std::sync::Mutex;

use nanda_core::protocol::{HeartbeatRequest, RegisterRequest};
use nanda_core::{HeartbeatOutcome, RegistrationState, RegistrationTracker};
use tracing::{debug, info, warn};

use crate::registry::{EndpointCell, RegistryClient};

pub struct RegistrationClient {
    handle: String,
    url: String,
    client: RegistryClient,
    endpoint: EndpointCell,
    tracker: Mutex<RegistrationTracker>,
}

impl RegistrationClient {
    /// `url` is the address registered for this agent.
    pub fn new(
        handle: &str,
        url: &str,
        client: RegistryClient,
        endpoint: EndpointCell,
        max_failures: u32,
    ) -> Self {
        Self {
            handle: handle.to_string(),
            url: url.to_string(),
            client,
            endpoint,
            tracker: Mutex::new(RegistrationTracker::with_max_failures(max_failures)),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.tracker().state()
    }

    pub fn is_registered(&self) -> bool {
        self.tracker().is_registered()
    }

    pub fn failures(&self) -> u32 {
        self.tracker().failures()
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, RegistrationTracker> {
        // Never held across an await; a poisoned lock still holds a valid tracker.
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `POST /agents`. On failure the state is left as it was.
    pub async fn register(&self) -> bool {
        let Some(endpoint) = self.endpoint.get().await else {
            debug!("register skipped: no endpoint");
            return false;
        };
        let body = RegisterRequest {
            handle: self.handle.clone(),
            url: self.url.clone(),
        };
        let ok = match self.client.register(&endpoint, &body).await {
            Ok(()) => true,
            Err(e) => {
                warn!(url = %endpoint, error = %e, "registration failed");
                false
            }
        };
        let state = self.tracker().on_register_result(ok);
        if ok {
            info!(url = %endpoint, handle = %self.handle, ?state, "registered");
        }
        ok
    }

    /// `POST /heartbeat`; returns false without a call unless registered. Reaching the
    /// failure threshold degrades the registration and re-registers once against the
    /// same endpoint.
    pub async fn heartbeat(&self) -> bool {
        if !self.is_registered() {
            return false;
        }
        let Some(endpoint) = self.endpoint.get().await else {
            return false;
        };
        let ok = match self
            .client
            .heartbeat(&endpoint, &HeartbeatRequest::healthy(&self.handle))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(url = %endpoint, error = %e, "heartbeat failed");
                false
            }
        };
        let outcome = self.tracker().on_heartbeat_result(ok);
        match outcome {
            HeartbeatOutcome::Healthy => true,
            HeartbeatOutcome::Failed { failures } => {
                warn!(failures, "heartbeat failed");
                false
            }
            HeartbeatOutcome::Degraded => {
                warn!(url = %endpoint, "registration degraded; re-registering");
                self.register().await;
                false
            }
            HeartbeatOutcome::Skipped => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEndpoint;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RegistrationClient {
        let cell = EndpointCell::default();
        cell.set(RegistryEndpoint::new(&server.uri())).await;
        RegistrationClient::new(
            "m5stick-a1b2c3",
            "http://192.168.1.50:8080",
            RegistryClient::new(Duration::from_secs(2)).unwrap(),
            cell,
            3,
        )
    }

    async fn mount(server: &MockServer, route: &str, status: u16, times: u64) {
        let mock = Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status));
        let mock = if times > 0 { mock.up_to_n_times(times) } else { mock };
        mock.expect(times).mount(server).await;
    }

    #[tokio::test]
    async fn register_success_and_failure() {
        let server = MockServer::start().await;
        mount(&server, "/agents", 500, 1).await;
        mount(&server, "/agents", 201, 1).await;
        let rc = client_for(&server).await;
        assert!(!rc.register().await);
        assert_eq!(rc.state(), RegistrationState::Unregistered);
        assert!(rc.register().await);
        assert_eq!(rc.state(), RegistrationState::Registered);
    }

    #[tokio::test]
    async fn heartbeat_is_noop_when_unregistered() {
        let server = MockServer::start().await;
        mount(&server, "/heartbeat", 200, 0).await;
        let rc = client_for(&server).await;
        assert!(!rc.heartbeat().await);
    }

    #[tokio::test]
    async fn no_endpoint_fails_fast() {
        let rc = RegistrationClient::new(
            "h",
            "http://x",
            RegistryClient::new(Duration::from_secs(1)).unwrap(),
            EndpointCell::default(),
            3,
        );
        assert!(!rc.register().await);
        assert_eq!(rc.state(), RegistrationState::Unregistered);
    }

    #[tokio::test]
    async fn three_failures_degrade_and_register_exactly_once() {
        let server = MockServer::start().await;
        // One initial registration, then exactly one re-registration.
        mount(&server, "/agents", 200, 1).await;
        mount(&server, "/agents", 503, 1).await;
        mount(&server, "/heartbeat", 500, 3).await;
        let rc = client_for(&server).await;
        assert!(rc.register().await);

        assert!(!rc.heartbeat().await);
        assert!(!rc.heartbeat().await);
        assert_eq!(rc.state(), RegistrationState::Registered);
        assert!(!rc.heartbeat().await);
        assert_eq!(rc.state(), RegistrationState::Degraded);

        // Degraded: further heartbeats do not reach the network.
        assert!(!rc.heartbeat().await);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let server = MockServer::start().await;
        mount(&server, "/agents", 200, 1).await;
        mount(&server, "/heartbeat", 500, 2).await;
        mount(&server, "/heartbeat", 200, 1).await;
        let rc = client_for(&server).await;
        assert!(rc.register().await);
        rc.heartbeat().await;
        rc.heartbeat().await;
        assert_eq!(rc.failures(), 2);
        assert!(rc.heartbeat().await);
        assert_eq!(rc.failures(), 0);
        assert_eq!(rc.state(), RegistrationState::Registered);
    }
}
