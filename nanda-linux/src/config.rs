//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nanda_core::tunnel::TunnelConfig;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_PUBLIC_REGISTRY_LIST: &str =
    "https://raw.githubusercontent.com/nanda-framework/registries/main/list.json";

/// Agent configuration. File: ~/.config/nanda/agent.toml or /etc/nanda/agent.toml.
/// Env overrides: NANDA_HTTP_PORT, NANDA_REGISTRY_PORT, NANDA_GATEWAY, NANDA_MAC, NANDA_STATE_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local HTTP server port (default 8080).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Well-known coordination service port (default 3000).
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,
    /// Network gateway; derived from the local address when absent.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Last octets probed on the gateway's /24 after the gateway itself.
    #[serde(default = "default_probe_octets")]
    pub probe_octets: Vec<u8>,
    #[serde(default = "default_public_registry_list")]
    pub public_registry_list: String,
    /// Skip certificate verification for the public registry list fetch.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    /// Hardware address override, e.g. "24:0a:c4:a1:b2:c3".
    #[serde(default)]
    pub mac: Option<String>,
    /// URL registered for this agent; defaults to http://<local ip>[:http_port].
    #[serde(default)]
    pub advertise_url: Option<String>,
    /// Persisted endpoint file (default ~/.local/state/nanda/state.toml).
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    #[serde(default = "default_mdns_browse_ms")]
    pub mdns_browse_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_peer_refresh_secs")]
    pub peer_refresh_secs: u64,
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_remote_fetch_timeout_secs")]
    pub remote_fetch_timeout_secs: u64,
    /// Timeout for registry REST calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_tunnel_reconnect_secs")]
    pub tunnel_reconnect_secs: u64,
    #[serde(default = "default_tunnel_keepalive_secs")]
    pub tunnel_keepalive_secs: u64,
    #[serde(default = "default_tunnel_ack_timeout_ms")]
    pub tunnel_ack_timeout_ms: u64,
    #[serde(default = "default_tunnel_max_missed_acks")]
    pub tunnel_max_missed_acks: u32,
    /// Bound on a single local request execution.
    #[serde(default = "default_executor_timeout_ms")]
    pub executor_timeout_ms: u64,
}

fn default_http_port() -> u16 {
    8080
}
fn default_registry_port() -> u16 {
    3000
}
fn default_probe_octets() -> Vec<u8> {
    vec![192, 100, 1, 104, 105, 102, 103, 10, 50]
}
fn default_public_registry_list() -> String {
    DEFAULT_PUBLIC_REGISTRY_LIST.to_string()
}
fn default_true() -> bool {
    true
}
fn default_mdns_browse_ms() -> u64 {
    1500
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_peer_refresh_secs() -> u64 {
    60
}
fn default_max_heartbeat_failures() -> u32 {
    nanda_core::registration::DEFAULT_MAX_HEARTBEAT_FAILURES
}
fn default_max_peers() -> usize {
    nanda_core::peers::DEFAULT_PEER_CAPACITY
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_remote_fetch_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    5
}
fn default_tunnel_reconnect_secs() -> u64 {
    10
}
fn default_tunnel_keepalive_secs() -> u64 {
    15
}
fn default_tunnel_ack_timeout_ms() -> u64 {
    3000
}
fn default_tunnel_max_missed_acks() -> u32 {
    nanda_core::tunnel::DEFAULT_MAX_MISSED_ACKS
}
fn default_executor_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            registry_port: default_registry_port(),
            gateway: None,
            probe_octets: default_probe_octets(),
            public_registry_list: default_public_registry_list(),
            accept_invalid_certs: true,
            mac: None,
            advertise_url: None,
            state_file: None,
            enable_mdns: true,
            mdns_browse_ms: default_mdns_browse_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            peer_refresh_secs: default_peer_refresh_secs(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            max_peers: default_max_peers(),
            probe_timeout_ms: default_probe_timeout_ms(),
            remote_fetch_timeout_secs: default_remote_fetch_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            tunnel_reconnect_secs: default_tunnel_reconnect_secs(),
            tunnel_keepalive_secs: default_tunnel_keepalive_secs(),
            tunnel_ack_timeout_ms: default_tunnel_ack_timeout_ms(),
            tunnel_max_missed_acks: default_tunnel_max_missed_acks(),
            executor_timeout_ms: default_executor_timeout_ms(),
        }
    }
}

impl Config {
    pub fn tunnel(&self) -> TunnelConfig {
        TunnelConfig {
            reconnect_interval: Duration::from_secs(self.tunnel_reconnect_secs),
            keepalive_interval: Duration::from_secs(self.tunnel_keepalive_secs),
            ack_timeout: Duration::from_millis(self.tunnel_ack_timeout_ms),
            max_missed_acks: self.tunnel_max_missed_acks,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn peer_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.peer_refresh_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn remote_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn mdns_browse_window(&self) -> Duration {
        Duration::from_millis(self.mdns_browse_ms)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(default_state_file)
    }
}

fn default_state_file() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/state/nanda/state.toml"),
        None => PathBuf::from("/var/lib/nanda/state.toml"),
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_path(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("NANDA_HTTP_PORT").and_then(|s| s.parse().ok()) {
        c.http_port = p;
    }
    if let Some(p) = var("NANDA_REGISTRY_PORT").and_then(|s| s.parse().ok()) {
        c.registry_port = p;
    }
    if let Some(g) = var("NANDA_GATEWAY").and_then(|s| s.parse().ok()) {
        c.gateway = Some(g);
    }
    if let Some(m) = var("NANDA_MAC").filter(|s| !s.is_empty()) {
        c.mac = Some(m);
    }
    if let Some(f) = var("NANDA_STATE_FILE").filter(|s| !s.is_empty()) {
        c.state_file = Some(PathBuf::from(f));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nanda/agent.toml"));
    }
    out.push(PathBuf::from("/etc/nanda/agent.toml"));
    out
}

fn load_path(p: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;
    let s = std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
    toml::from_str(&s).with_context(|| format!("parse {}", p.display()))
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match load_path(&p) {
                Ok(c) => return Some(c),
                Err(e) => warn!("ignoring config: {:#}", e),
            }
            break;
        }
    }
    None
}
