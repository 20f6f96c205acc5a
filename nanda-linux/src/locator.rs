//! Registry Locator: ordered search for a coordination endpoint.
//!
//! Strategies, first success wins: persisted store, mDNS, gateway probe sweep,
//! public registry list, and finally the unverified gateway guess. The result
//! is written to the shared [`EndpointCell`]; nothing else writes it.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nanda_core::RegistryList;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::mdns::{pick_registry, ServiceBrowser, HTTP_SERVICE, REGISTRY_SERVICE};
use crate::registry::{EndpointCell, RegistryClient, RegistryEndpoint};
use crate::store::EndpointStore;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("a registry search is already running")]
    InFlight,
}

/// Which strategy produced the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateSource {
    Persisted,
    Mdns,
    Probe,
    RemoteList,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct LocatorSettings {
    pub gateway: Ipv4Addr,
    pub registry_port: u16,
    pub probe_octets: Vec<u8>,
    pub probe_timeout: Duration,
    pub mdns_window: Duration,
    pub remote_list_url: String,
    pub remote_timeout: Duration,
    pub accept_invalid_certs: bool,
    /// Our own mDNS hostname, never taken for a registry.
    pub own_hostname: String,
}

impl LocatorSettings {
    pub fn from_config(cfg: &Config, gateway: Ipv4Addr, own_hostname: &str) -> Self {
        Self {
            gateway,
            registry_port: cfg.registry_port,
            probe_octets: cfg.probe_octets.clone(),
            probe_timeout: cfg.probe_timeout(),
            mdns_window: cfg.mdns_browse_window(),
            remote_list_url: cfg.public_registry_list.clone(),
            remote_timeout: cfg.remote_fetch_timeout(),
            accept_invalid_certs: cfg.accept_invalid_certs,
            own_hostname: own_hostname.to_string(),
        }
    }

    fn fallback(&self) -> RegistryEndpoint {
        RegistryEndpoint::new(&format!("http://{}:{}", self.gateway, self.registry_port))
    }
}

/// Configured gateway, else the primary local IPv4 address with last octet 1.
pub fn resolve_gateway(configured: Option<Ipv4Addr>) -> Ipv4Addr {
    if let Some(g) = configured {
        return g;
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 1)
        }
        Ok(IpAddr::V6(_)) | Err(_) => {
            warn!("no local IPv4 address; assuming gateway 192.168.1.1");
            Ipv4Addr::new(192, 168, 1, 1)
        }
    }
}

/// Gateway first, then each configured last octet on the gateway's /24, without repeats.
pub fn probe_candidates(gateway: Ipv4Addr, octets: &[u8]) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = gateway.octets();
    let mut out = vec![gateway];
    for &o in octets {
        let ip = Ipv4Addr::new(a, b, c, o);
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

pub struct RegistryLocator<B> {
    store: Arc<dyn EndpointStore>,
    browser: Option<B>,
    client: RegistryClient,
    remote: reqwest::Client,
    endpoint: EndpointCell,
    settings: LocatorSettings,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: ServiceBrowser> RegistryLocator<B> {
    /// `browser` is `None` when mDNS is disabled.
    pub fn new(
        store: Arc<dyn EndpointStore>,
        browser: Option<B>,
        client: RegistryClient,
        endpoint: EndpointCell,
        settings: LocatorSettings,
    ) -> Result<Self, reqwest::Error> {
        let remote = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .timeout(settings.remote_timeout)
            .build()?;
        Ok(Self {
            store,
            browser,
            client,
            remote,
            endpoint,
            settings,
            in_flight: AtomicBool::new(false),
        })
    }

    /// Run the search once and publish the result. Always yields an endpoint
    /// unless another search is already running.
    pub async fn locate(&self) -> Result<(RegistryEndpoint, LocateSource), LocateError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("locate already in flight; ignoring");
            return Err(LocateError::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let (endpoint, source) = self.search().await;
        info!(url = %endpoint, ?source, "registry located");
        self.endpoint.set(endpoint.clone()).await;
        Ok((endpoint, source))
    }

    async fn search(&self) -> (RegistryEndpoint, LocateSource) {
        if let Some(url) = self.store.load() {
            return (RegistryEndpoint::new(&url), LocateSource::Persisted);
        }
        if let Some(ep) = self.from_mdns().await {
            return (ep, LocateSource::Mdns);
        }
        if let Some(ep) = self.from_probe().await {
            return (ep, LocateSource::Probe);
        }
        if let Some(ep) = self.from_remote_list().await {
            return (ep, LocateSource::RemoteList);
        }
        let ep = self.settings.fallback();
        warn!(url = %ep, "no registry found; using unverified gateway fallback");
        (ep, LocateSource::Fallback)
    }

    async fn from_mdns(&self) -> Option<RegistryEndpoint> {
        let browser = self.browser.as_ref()?;
        let window = self.settings.mdns_window;
        let dedicated = browser.browse(REGISTRY_SERVICE, window).await;
        let generic = if dedicated.is_empty() {
            browser.browse(HTTP_SERVICE, window).await
        } else {
            Vec::new()
        };
        let found = pick_registry(&dedicated, &generic, &self.settings.own_hostname)?;
        let ep = RegistryEndpoint::new(&found.base_url());
        match self.client.health(&ep, self.settings.probe_timeout).await {
            Ok(()) => Some(ep),
            Err(e) => {
                debug!(url = %ep, error = %e, "mdns candidate failed health check");
                None
            }
        }
    }

    async fn from_probe(&self) -> Option<RegistryEndpoint> {
        for ip in probe_candidates(self.settings.gateway, &self.settings.probe_octets) {
            let ep = RegistryEndpoint::new(&format!("http://{}:{}", ip, self.settings.registry_port));
            match self.client.health(&ep, self.settings.probe_timeout).await {
                Ok(()) => return Some(ep),
                Err(e) => debug!(url = %ep, error = %e, "probe failed"),
            }
        }
        None
    }

    async fn from_remote_list(&self) -> Option<RegistryEndpoint> {
        let url = &self.settings.remote_list_url;
        let resp = match self.remote.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(%url, status = r.status().as_u16(), "registry list unavailable");
                return None;
            }
            Err(e) => {
                debug!(%url, error = %e, "registry list fetch failed");
                return None;
            }
        };
        match resp.json::<RegistryList>().await {
            Ok(list) => list.first_url().map(RegistryEndpoint::new),
            Err(e) => {
                warn!(%url, error = %e, "registry list malformed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::DiscoveredService;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedStore(Option<String>);

    impl EndpointStore for FixedStore {
        fn load(&self) -> Option<String> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct FakeBrowser {
        services: HashMap<&'static str, Vec<DiscoveredService>>,
        calls: Arc<AtomicUsize>,
        queried: Arc<Mutex<Vec<String>>>,
    }

    impl ServiceBrowser for FakeBrowser {
        async fn browse(&self, service_type: &str, _window: Duration) -> Vec<DiscoveredService> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queried.lock().unwrap().push(service_type.to_string());
            self.services.get(service_type).cloned().unwrap_or_default()
        }
    }

    // 127.0.0.2 refuses connections on any port, so probes against it fail fast.
    const DEAD_GATEWAY: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

    fn settings(port: u16, octets: Vec<u8>, remote: &str) -> LocatorSettings {
        LocatorSettings {
            gateway: DEAD_GATEWAY,
            registry_port: port,
            probe_octets: octets,
            probe_timeout: Duration::from_millis(500),
            mdns_window: Duration::from_millis(10),
            remote_list_url: remote.to_string(),
            remote_timeout: Duration::from_secs(2),
            accept_invalid_certs: true,
            own_hostname: "nanda-a1b2c3".into(),
        }
    }

    fn locator(
        store: Option<&str>,
        browser: Option<FakeBrowser>,
        settings: LocatorSettings,
    ) -> (RegistryLocator<FakeBrowser>, EndpointCell) {
        let cell = EndpointCell::default();
        let loc = RegistryLocator::new(
            Arc::new(FixedStore(store.map(String::from))),
            browser,
            RegistryClient::new(Duration::from_secs(2)).unwrap(),
            cell.clone(),
            settings,
        )
        .unwrap();
        (loc, cell)
    }

    async fn health_ok(server: &MockServer, times: u64) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .expect(times)
            .mount(server)
            .await;
    }

    fn service_at(server: &MockServer, host: &str) -> DiscoveredService {
        let addr = server.address();
        DiscoveredService {
            hostname: host.into(),
            addr: addr.ip(),
            port: addr.port(),
        }
    }

    #[test]
    fn candidates_start_at_gateway_and_skip_repeats() {
        let got = probe_candidates(Ipv4Addr::new(10, 0, 0, 1), &[192, 100, 1, 104, 10]);
        let want: Vec<Ipv4Addr> = [1, 192, 100, 104, 10]
            .iter()
            .map(|o| Ipv4Addr::new(10, 0, 0, *o))
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn configured_gateway_used_verbatim() {
        let g = Ipv4Addr::new(172, 16, 4, 254);
        assert_eq!(resolve_gateway(Some(g)), g);
    }

    #[tokio::test]
    async fn persisted_endpoint_skips_network() {
        let server = MockServer::start().await;
        health_ok(&server, 0).await;
        let browser = FakeBrowser::default();
        let calls = browser.calls.clone();
        let (loc, cell) = locator(
            Some("http://10.9.9.9:3000"),
            Some(browser),
            settings(server.address().port(), vec![], &format!("{}/list.json", server.uri())),
        );
        let (ep, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::Persisted);
        assert_eq!(ep.base_url(), "http://10.9.9.9:3000");
        assert_eq!(cell.get().await, Some(ep));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mdns_dedicated_record_verified_by_health() {
        let server = MockServer::start().await;
        health_ok(&server, 1).await;
        let mut browser = FakeBrowser::default();
        browser
            .services
            .insert(REGISTRY_SERVICE, vec![service_at(&server, "hub.local")]);
        let queried = browser.queried.clone();
        let (loc, _) = locator(None, Some(browser), settings(9, vec![], "http://127.0.0.2:9/list"));
        let (ep, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::Mdns);
        assert_eq!(ep.base_url(), server.uri());
        assert_eq!(*queried.lock().unwrap(), vec![REGISTRY_SERVICE.to_string()]);
    }

    #[tokio::test]
    async fn mdns_generic_record_needs_token() {
        let server = MockServer::start().await;
        health_ok(&server, 1).await;
        let mut browser = FakeBrowser::default();
        browser.services.insert(
            HTTP_SERVICE,
            vec![
                service_at(&server, "printer.local"),
                service_at(&server, "nanda-registry.local"),
            ],
        );
        let queried = browser.queried.clone();
        let (loc, _) = locator(None, Some(browser), settings(9, vec![], "http://127.0.0.2:9/list"));
        let (_, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::Mdns);
        assert_eq!(
            *queried.lock().unwrap(),
            vec![REGISTRY_SERVICE.to_string(), HTTP_SERVICE.to_string()]
        );
    }

    #[tokio::test]
    async fn probe_tries_gateway_then_subnet() {
        let server = MockServer::start().await;
        health_ok(&server, 1).await;
        // Gateway 127.0.0.2 refuses; octet 1 lands on the mock server.
        let (loc, _) = locator(
            None,
            None,
            settings(server.address().port(), vec![1, 3], "http://127.0.0.2:9/list"),
        );
        let (ep, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::Probe);
        assert_eq!(ep.base_url(), format!("http://127.0.0.1:{}", server.address().port()));
    }

    #[tokio::test]
    async fn remote_list_first_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "registries": [{"url": "https://registry.example.org"}, {"url": "https://b.example"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (loc, _) = locator(
            None,
            None,
            settings(9, vec![], &format!("{}/list.json", server.uri())),
        );
        let (ep, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::RemoteList);
        assert_eq!(ep.base_url(), "https://registry.example.org");
    }

    #[tokio::test]
    async fn everything_fails_falls_back_to_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list.json"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let (loc, cell) = locator(
            None,
            Some(FakeBrowser::default()),
            settings(3000, vec![], &format!("{}/list.json", server.uri())),
        );
        let (ep, source) = loc.locate().await.unwrap();
        assert_eq!(source, LocateSource::Fallback);
        assert_eq!(ep.base_url(), "http://127.0.0.2:3000");
        assert_eq!(cell.get().await.unwrap().base_url(), "http://127.0.0.2:3000");
    }

    #[tokio::test]
    async fn empty_remote_list_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"registries\":[]}"))
            .mount(&server)
            .await;
        let (loc, _) = locator(None, None, settings(3000, vec![], &format!("{}/list.json", server.uri())));
        assert_eq!(loc.locate().await.unwrap().1, LocateSource::Fallback);
    }

    #[tokio::test]
    async fn second_locate_while_running_is_rejected() {
        let (loc, _) = locator(Some("http://10.0.0.1:3000"), None, settings(9, vec![], "http://x"));
        loc.in_flight.store(true, Ordering::SeqCst);
        assert!(matches!(loc.locate().await, Err(LocateError::InFlight)));
        loc.in_flight.store(false, Ordering::SeqCst);
        assert!(loc.locate().await.is_ok());
        assert!(!loc.in_flight.load(Ordering::SeqCst));
    }
}
