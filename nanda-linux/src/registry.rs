//! Coordination service REST client and the shared active endpoint.

use std::sync::Arc;
use std::time::Duration;

use nanda_core::protocol::{HeartbeatRequest, RegisterRequest};
use tokio::sync::RwLock;

/// Base URL of the coordination service, without trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    base_url: String,
}

impl RegistryEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn join(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl std::fmt::Display for RegistryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base_url)
    }
}

/// The single active endpoint. Read by every component; written only by the locator.
#[derive(Clone, Default)]
pub struct EndpointCell(Arc<RwLock<Option<RegistryEndpoint>>>);

impl EndpointCell {
    pub async fn get(&self) -> Option<RegistryEndpoint> {
        self.0.read().await.clone()
    }

    pub(crate) async fn set(&self, endpoint: RegistryEndpoint) {
        *self.0.write().await = Some(endpoint);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
}

/// REST calls against `GET /health`, `POST /agents`, `POST /heartbeat`, `GET /agents`.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
}

impl RegistryClient {
    /// Every call is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Reachable iff `GET /health` answers 200 within `timeout`.
    pub async fn health(
        &self,
        endpoint: &RegistryEndpoint,
        timeout: Duration,
    ) -> Result<(), RegistryError> {
        let resp = self
            .client
            .get(endpoint.join("/health"))
            .timeout(timeout)
            .send()
            .await?;
        expect_status(resp.status().as_u16(), &[200])
    }

    /// `POST /agents`; 200 or 201 is success.
    pub async fn register(
        &self,
        endpoint: &RegistryEndpoint,
        body: &RegisterRequest,
    ) -> Result<(), RegistryError> {
        let resp = self
            .client
            .post(endpoint.join("/agents"))
            .json(body)
            .send()
            .await?;
        expect_status(resp.status().as_u16(), &[200, 201])
    }

    pub async fn heartbeat(
        &self,
        endpoint: &RegistryEndpoint,
        body: &HeartbeatRequest,
    ) -> Result<(), RegistryError> {
        let resp = self
            .client
            .post(endpoint.join("/heartbeat"))
            .json(body)
            .send()
            .await?;
        expect_status(resp.status().as_u16(), &[200])
    }

    /// Raw `GET /agents` body; parsing is left to the peer directory.
    pub async fn agents(&self, endpoint: &RegistryEndpoint) -> Result<String, RegistryError> {
        let resp = self.client.get(endpoint.join("/agents")).send().await?;
        expect_status(resp.status().as_u16(), &[200])?;
        Ok(resp.text().await?)
    }
}

fn expect_status(status: u16, ok: &[u16]) -> Result<(), RegistryError> {
    if ok.contains(&status) {
        Ok(())
    } else {
        Err(RegistryError::Status(status))
    }
}
