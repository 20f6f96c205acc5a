//! Coordinator: owns every component and the timers that drive them.
//!
//! Startup order is identity, locate, register; the tunnel and peer refresh only do
//! work once registered. Each timer is its own task so none waits on another.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nanda_core::{ConnectivityStatus, DeviceIdentity, PeerRecord, RegistrationState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::SharedExecutor;
use crate::locator::{LocateError, LocateSource, LocatorSettings, RegistryLocator};
use crate::mdns::MdnsBrowser;
use crate::peers::PeerRefresher;
use crate::registration::RegistrationClient;
use crate::registry::{EndpointCell, RegistryClient};
use crate::status::{self, StatusHandle};
use crate::store::EndpointStore;
use crate::tunnel::TunnelDriver;

/// URL registered for this agent: configured, else `http://<local ip>[:port]`.
pub fn advertise_url(cfg: &Config) -> String {
    if let Some(u) = cfg.advertise_url.as_deref().filter(|u| !u.is_empty()) {
        return u.to_string();
    }
    let ip = local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    match cfg.http_port {
        80 => format!("http://{}", ip),
        port => format!("http://{}:{}", ip, port),
    }
}

/// Everything the agent needs from the host.
pub struct AgentParts {
    pub config: Config,
    pub identity: DeviceIdentity,
    pub agent_url: String,
    pub gateway: Ipv4Addr,
    pub store: Arc<dyn EndpointStore>,
    /// None when mDNS is disabled.
    pub browser: Option<MdnsBrowser>,
    pub executor: SharedExecutor,
}

pub struct Agent {
    config: Config,
    identity: DeviceIdentity,
    endpoint: EndpointCell,
    locator: RegistryLocator<MdnsBrowser>,
    registration: Arc<RegistrationClient>,
    peers: PeerRefresher,
    executor: SharedExecutor,
    status: StatusHandle,
    /// Failed re-registrations on the cached endpoint since entering DEGRADED.
    degraded_retries: AtomicU32,
}

impl Agent {
    pub fn new(parts: AgentParts) -> anyhow::Result<Arc<Self>> {
        let AgentParts {
            config,
            identity,
            agent_url,
            gateway,
            store,
            browser,
            executor,
        } = parts;
        let endpoint = EndpointCell::default();
        let client = RegistryClient::new(config.request_timeout())?;
        let settings = LocatorSettings::from_config(&config, gateway, identity.hostname());
        let locator =
            RegistryLocator::new(store, browser, client.clone(), endpoint.clone(), settings)?;
        let registration = Arc::new(RegistrationClient::new(
            identity.handle(),
            &agent_url,
            client.clone(),
            endpoint.clone(),
            config.max_heartbeat_failures,
        ));
        let peers = PeerRefresher::new(
            identity.handle(),
            config.max_peers,
            client,
            endpoint.clone(),
            registration.clone(),
        );
        Ok(Arc::new(Self {
            config,
            identity,
            endpoint,
            locator,
            registration,
            peers,
            executor,
            status: StatusHandle::new(),
            degraded_retries: AtomicU32::new(0),
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    /// Locate, register, and on success fetch peers. Failure leaves the agent standalone.
    pub async fn startup(&self) -> RegistrationState {
        self.locate().await;
        if self.registration.register().await {
            self.refresh_peers().await;
        } else {
            warn!(handle = %self.identity.handle(), "not registered; running standalone");
        }
        self.publish().await;
        self.registration.state()
    }

    async fn locate(&self) -> Option<LocateSource> {
        let found = match self.locator.locate().await {
            Ok((_, source)) => Some(source),
            Err(LocateError::InFlight) => None,
        };
        self.publish().await;
        found
    }

    /// Liveness timer body: heartbeat while registered, retry registration on the
    /// cached endpoint while degraded, nothing while unregistered. After
    /// `max_heartbeat_failures` refused retries the registry is searched for again.
    pub async fn liveness_tick(&self) {
        match self.registration.state() {
            RegistrationState::Registered => {
                self.degraded_retries.store(0, Ordering::Relaxed);
                self.registration.heartbeat().await;
            }
            RegistrationState::Degraded => {
                if self.registration.register().await {
                    self.degraded_retries.store(0, Ordering::Relaxed);
                } else {
                    self.rediscover_if_exhausted().await;
                }
            }
            RegistrationState::Unregistered => {}
        }
        debug!(failures = self.registration.failures(), "liveness tick");
        self.publish().await;
    }

    async fn rediscover_if_exhausted(&self) {
        let retries = self.degraded_retries.fetch_add(1, Ordering::Relaxed) + 1;
        if retries < self.config.max_heartbeat_failures {
            return;
        }
        self.degraded_retries.store(0, Ordering::Relaxed);
        info!(retries, "cached registry keeps refusing; searching again");
        if self.locate().await.is_some() && self.registration.register().await {
            self.refresh_peers().await;
        }
    }

    pub async fn refresh_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.refresh().await;
        self.publish().await;
        peers
    }

    /// User-triggered refresh. Returns whether the agent ends up registered.
    pub async fn retrigger(&self) -> bool {
        let ok = if self.registration.is_registered() {
            self.registration.heartbeat().await
        } else {
            self.registration.register().await
        };
        if !ok && !self.registration.is_registered() {
            info!("registration failed; searching for the registry again");
            self.locate().await;
            self.registration.register().await;
        }
        self.refresh_peers().await;
        self.registration.is_registered()
    }

    /// Run [`retrigger`](Self::retrigger) once per trigger until every sender is gone.
    pub fn listen_for_retriggers(self: &Arc<Self>, mut triggers: mpsc::Receiver<()>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            while triggers.recv().await.is_some() {
                let registered = agent.retrigger().await;
                info!(registered, peers = agent.peers.len(), "manual refresh done");
            }
        })
    }

    async fn publish(&self) {
        let registry_url = self.endpoint.get().await.map(|e| e.to_string());
        let registration = self.registration.state();
        let peer_count = self.peers.len();
        self.status.update(|s| {
            s.registry_url = registry_url;
            s.registration = registration;
            s.peer_count = peer_count;
        });
    }

    /// Spawn the timers, the tunnel driver and the status logger. Abort the handles to stop.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let agent = self.clone();
        let every = self.config.heartbeat_interval();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                agent.liveness_tick().await;
            }
        }));

        let agent = self.clone();
        let every = self.config.peer_refresh_interval();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let n = agent.refresh_peers().await.len();
                debug!(peers = n, "peer timer");
            }
        }));

        let driver = TunnelDriver::new(
            self.identity.handle(),
            self.config.tunnel(),
            self.executor.clone(),
            self.config.executor_timeout(),
            self.endpoint.clone(),
            self.registration.clone(),
            self.status.clone(),
        );
        tasks.push(tokio::spawn(driver.run()));

        tasks.push(tokio::spawn(status::log_changes(self.subscribe())));
        tasks
    }
}
