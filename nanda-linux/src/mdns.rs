//! mDNS: browse for the coordination service and advertise this agent.
//!
//! The agent registers `_nanda._tcp.local.` (with identity TXT records) and
//! `_http._tcp.local.` under `nanda-<short_id>.local.`. The locator browses
//! `_nanda-registry._tcp.local.` first, then falls back to `_http._tcp.local.`
//! and keeps only hosts whose name carries a registry token.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use nanda_core::DeviceIdentity;
use tracing::{debug, info, warn};

pub const REGISTRY_SERVICE: &str = "_nanda-registry._tcp.local.";
pub const HTTP_SERVICE: &str = "_http._tcp.local.";
pub const AGENT_SERVICE: &str = "_nanda._tcp.local.";

const REGISTRY_TOKENS: [&str; 2] = ["nanda", "registry"];
const CAPABILITIES: &str = "sensors,display,buzzer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub hostname: String,
    pub addr: IpAddr,
    pub port: u16,
}

impl DiscoveredService {
    pub fn base_url(&self) -> String {
        match self.addr {
            IpAddr::V4(a) => format!("http://{}:{}", a, self.port),
            IpAddr::V6(a) => format!("http://[{}]:{}", a, self.port),
        }
    }

    fn looks_like_registry(&self) -> bool {
        let host = self.hostname.to_ascii_lowercase();
        REGISTRY_TOKENS.iter().any(|t| host.contains(t))
    }
}

/// Source of resolved mDNS services; a seam so the locator can be tested without multicast.
pub trait ServiceBrowser: Send + Sync {
    /// Everything resolved for `service_type` within `window`.
    fn browse(
        &self,
        service_type: &str,
        window: Duration,
    ) -> impl Future<Output = Vec<DiscoveredService>> + Send;
}

/// Dedicated registry record first; otherwise the first generic web service whose
/// hostname carries a registry token, excluding our own advertisement.
pub fn pick_registry(
    dedicated: &[DiscoveredService],
    generic: &[DiscoveredService],
    own_hostname: &str,
) -> Option<DiscoveredService> {
    if let Some(s) = dedicated.first() {
        return Some(s.clone());
    }
    let own = own_hostname.to_ascii_lowercase();
    generic
        .iter()
        .filter(|s| !s.hostname.to_ascii_lowercase().starts_with(&own))
        .find(|s| s.looks_like_registry())
        .cloned()
}

/// `ServiceBrowser` over a shared `mdns-sd` daemon.
#[derive(Clone)]
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self { daemon }
    }
}

impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self, service_type: &str, window: Duration) -> Vec<DiscoveredService> {
        let receiver = match self.daemon.browse(service_type) {
            Ok(r) => r,
            Err(e) => {
                warn!(service = service_type, error = %e, "mdns browse failed");
                return Vec::new();
            }
        };
        let deadline = tokio::time::Instant::now() + window;
        let mut found = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(s) = from_info(&info) {
                        debug!(host = %s.hostname, url = %s.base_url(), "mdns resolved");
                        found.push(s);
                    }
                }
                Ok(Ok(_)) => {}
                // Channel closed or window elapsed.
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!(service = service_type, error = %e, "mdns stop_browse");
        }
        found
    }
}

fn from_info(info: &ServiceInfo) -> Option<DiscoveredService> {
    let addr = info
        .get_addresses()
        .iter()
        .copied()
        .min_by_key(|a| a.is_ipv6())?;
    Some(DiscoveredService {
        hostname: info.get_hostname().trim_end_matches('.').to_string(),
        addr,
        port: info.get_port(),
    })
}

/// Register `_nanda._tcp` and `_http._tcp` for this agent.
pub fn advertise(
    daemon: &ServiceDaemon,
    identity: &DeviceIdentity,
    http_port: u16,
    version: &str,
) -> Result<(), mdns_sd::Error> {
    let host = format!("{}.local.", identity.hostname());
    let properties = [
        ("version".to_string(), version.to_string()),
        ("type".to_string(), "a2a-agent".to_string()),
        ("handle".to_string(), identity.handle().to_string()),
        ("deviceId".to_string(), identity.full_id().to_string()),
        ("capabilities".to_string(), CAPABILITIES.to_string()),
    ];
    let agent = ServiceInfo::new(
        AGENT_SERVICE,
        identity.hostname(),
        &host,
        "",
        http_port,
        &properties[..],
    )?
    .enable_addr_auto();
    daemon.register(agent)?;

    let http = ServiceInfo::new(
        HTTP_SERVICE,
        identity.hostname(),
        &host,
        "",
        http_port,
        None::<std::collections::HashMap<String, String>>,
    )?
    .enable_addr_auto();
    daemon.register(http)?;

    info!(host = %host, port = http_port, "mdns advertising");
    Ok(())
}
