//! Peer Directory refresh against `GET /agents`.

use std::sync::{Arc, RwLock};

use nanda_core::{PeerDirectory, PeerRecord};
use tracing::{debug, warn};

use crate::registration::RegistrationClient;
use crate::registry::{EndpointCell, RegistryClient};

pub struct PeerRefresher {
    client: RegistryClient,
    endpoint: EndpointCell,
    registration: Arc<RegistrationClient>,
    directory: RwLock<PeerDirectory>,
}

impl PeerRefresher {
    pub fn new(
        own_handle: &str,
        capacity: usize,
        client: RegistryClient,
        endpoint: EndpointCell,
        registration: Arc<RegistrationClient>,
    ) -> Self {
        Self {
            client,
            endpoint,
            registration,
            directory: RwLock::new(PeerDirectory::with_capacity(own_handle, capacity)),
        }
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.directory
            .read()
            .map(|d| d.snapshot().to_vec())
            .unwrap_or_else(|e| e.into_inner().snapshot().to_vec())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Fetch and replace the snapshot. Not registered, or any failure, leaves the
    /// previous snapshot in place. Returns the current snapshot either way.
    pub async fn refresh(&self) -> Vec<PeerRecord> {
        if !self.registration.is_registered() {
            return self.snapshot();
        }
        let Some(endpoint) = self.endpoint.get().await else {
            return self.snapshot();
        };
        let body = match self.client.agents(&endpoint).await {
            Ok(b) => b,
            Err(e) => {
                debug!(url = %endpoint, error = %e, "peer refresh failed");
                return self.snapshot();
            }
        };
        let mut dir = self.directory.write().unwrap_or_else(|e| e.into_inner());
        match dir.replace_from_json(&body) {
            Ok(n) => debug!(peers = n, "peer directory refreshed"),
            Err(e) => warn!(error = %e, "peer list malformed; keeping previous snapshot"),
        }
        dir.snapshot().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEndpoint;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OWN: &str = "m5stick-a1b2c3";

    async fn refresher(server: &MockServer, register: bool) -> PeerRefresher {
        let cell = EndpointCell::default();
        cell.set(RegistryEndpoint::new(&server.uri())).await;
        let client = RegistryClient::new(Duration::from_secs(2)).unwrap();
        let reg = Arc::new(RegistrationClient::new(
            OWN,
            "http://10.0.0.2",
            client.clone(),
            cell.clone(),
            3,
        ));
        if register {
            Mock::given(method("POST"))
                .and(path("/agents"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
            assert!(reg.register().await);
        }
        PeerRefresher::new(OWN, 10, client, cell, reg)
    }

    fn agents_body(n: usize) -> serde_json::Value {
        let mut agents = vec![serde_json::json!({"handle": OWN, "url": "http://self"})];
        agents.extend((0..n).map(|i| {
            serde_json::json!({"handle": format!("m5stick-{:06x}", i), "url": format!("http://10.0.0.{}", i), "healthy": true})
        }));
        serde_json::json!({ "agents": agents })
    }

    #[tokio::test]
    async fn noop_when_unregistered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agents_body(2)))
            .expect(0)
            .mount(&server)
            .await;
        let p = refresher(&server, false).await;
        assert!(p.refresh().await.is_empty());
    }

    #[tokio::test]
    async fn excludes_self_and_caps_at_ten() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agents_body(15)))
            .mount(&server)
            .await;
        let p = refresher(&server, true).await;
        let peers = p.refresh().await;
        assert_eq!(peers.len(), 10);
        assert!(peers.iter().all(|r| r.handle != OWN));
        assert_eq!(peers[0].handle, "m5stick-000000");
        assert_eq!(p.len(), 10);
    }

    #[tokio::test]
    async fn failures_keep_previous_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agents_body(3)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"agents\": [oops"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let p = refresher(&server, true).await;
        let first = p.refresh().await;
        assert_eq!(first.len(), 3);
        assert_eq!(p.refresh().await, first);
        assert_eq!(p.refresh().await, first);
    }
}
