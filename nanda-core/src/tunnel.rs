//! Tunnel session: one outbound persistent connection to the coordination endpoint that
//! carries relayed requests in and correlated responses out.
//!
//! The session is a pure state machine. The host reports transport events and inbound
//! frames through [`TunnelSession::handle_event`], calls [`TunnelSession::poll`] on a short
//! tick, and carries out the returned [`TunnelAction`]s.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::executor::ExecutorResponse;
use crate::protocol::{TunnelMessage, TUNNEL_PATH};
use crate::wire::{decode_message, encode_message};

/// Port used when the registry URL carries none.
pub const DEFAULT_TUNNEL_PORT: u16 = 80;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_MISSED_ACKS: u32 = 2;

/// Where the tunnel connects: host/port of the registry endpoint plus the fixed tunnel path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    host: String,
    port: u16,
    path: String,
}

impl TunnelTarget {
    /// Strip the scheme, split host and port on the last colon (default 80), append
    /// `/tunnel?handle=<handle>`. Returns None when the URL has no host.
    pub fn from_endpoint(base_url: &str, handle: &str) -> Option<Self> {
        let rest = match base_url.trim().split_once("://") {
            Some((_, r)) => r,
            None => base_url.trim(),
        };
        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !authority.ends_with(']') => {
                (h, p.parse().unwrap_or(DEFAULT_TUNNEL_PORT))
            }
            _ => (authority, DEFAULT_TUNNEL_PORT),
        };
        if host.is_empty() {
            return None;
        }
        let handle: String = url::form_urlencoded::byte_serialize(handle.as_bytes()).collect();
        Some(Self {
            host: host.to_string(),
            port,
            path: format!("{}?handle={}", TUNNEL_PATH, handle),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path including the handle query.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Minimum spacing between connect attempts, and between a disconnect and the next attempt.
    pub reconnect_interval: Duration,
    /// Cadence of outbound `heartbeat` frames while connected.
    pub keepalive_interval: Duration,
    /// How long a `heartbeat` may go unacknowledged before it counts as missed.
    pub ack_timeout: Duration,
    /// Consecutive missed acknowledgments that force the connection closed.
    pub max_missed_acks: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_missed_acks: DEFAULT_MAX_MISSED_ACKS,
        }
    }
}

/// Events the host reports to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Transport handshake completed.
    Opened,
    /// Transport closed or errored, or the connect attempt failed.
    Closed,
    /// Inbound text frame.
    Text(String),
}

/// A relayed request awaiting execution. Lives for one dispatch-execute-respond cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    pub body: String,
    /// Connection the request arrived on; the response is only sent on the same one.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Frame arrived while the session was not connected.
    NotConnected,
    /// Not JSON, or not a known message type.
    Malformed(String),
    /// Well-formed but not something the server should send.
    Unexpected(&'static str),
}

/// Actions the host must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    /// Open the transport to this target, then report Opened or Closed.
    Connect(TunnelTarget),
    /// Send one text frame.
    Send(String),
    /// Run the request through the local executor, then call `respond`.
    Dispatch(RelayRequest),
    /// Drop the transport.
    Close,
    /// Server confirmed the session.
    Confirmed { handle: Option<String> },
    /// Inbound frame dropped; the connection stays open.
    Discarded(DiscardReason),
}

pub struct TunnelSession {
    handle: String,
    config: TunnelConfig,
    state: TunnelState,
    target: Option<TunnelTarget>,
    registered: bool,
    last_reconnect_attempt: Option<Instant>,
    disconnected_at: Option<Instant>,
    next_keepalive: Option<Instant>,
    ack_deadline: Option<Instant>,
    missed_acks: u32,
    generation: u64,
}

impl TunnelSession {
    pub fn new(handle: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            handle: handle.into(),
            config,
            state: TunnelState::Disconnected,
            target: None,
            registered: false,
            last_reconnect_attempt: None,
            disconnected_at: None,
            next_keepalive: None,
            ack_deadline: None,
            missed_acks: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TunnelState::Connected
    }

    /// Incremented on every successful open.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn missed_acks(&self) -> u32 {
        self.missed_acks
    }

    pub fn target(&self) -> Option<&TunnelTarget> {
        self.target.as_ref()
    }

    pub fn last_reconnect_attempt(&self) -> Option<Instant> {
        self.last_reconnect_attempt
    }

    /// Reconnects only happen while registered; losing registration closes the session.
    pub fn set_registered(&mut self, registered: bool, now: Instant) -> Vec<TunnelAction> {
        self.registered = registered;
        if !registered && self.state != TunnelState::Disconnected {
            self.disconnect(now);
            return vec![TunnelAction::Close];
        }
        vec![]
    }

    /// The target follows the registry endpoint; a change drops the current connection.
    pub fn set_endpoint(&mut self, base_url: Option<&str>, now: Instant) -> Vec<TunnelAction> {
        let target = base_url.and_then(|u| TunnelTarget::from_endpoint(u, &self.handle));
        if target == self.target {
            return vec![];
        }
        self.target = target;
        if self.state != TunnelState::Disconnected {
            self.disconnect(now);
            return vec![TunnelAction::Close];
        }
        vec![]
    }

    pub fn handle_event(&mut self, event: TunnelEvent, now: Instant) -> Vec<TunnelAction> {
        match event {
            TunnelEvent::Opened => {
                if self.state != TunnelState::Connecting {
                    return vec![TunnelAction::Close];
                }
                self.state = TunnelState::Connected;
                self.generation = self.generation.wrapping_add(1);
                self.missed_acks = 0;
                self.ack_deadline = None;
                self.next_keepalive = Some(now + self.config.keepalive_interval);
                vec![]
            }
            TunnelEvent::Closed => {
                if self.state != TunnelState::Disconnected {
                    self.disconnect(now);
                }
                vec![]
            }
            TunnelEvent::Text(text) => self.on_text(&text),
        }
    }

    fn on_text(&mut self, text: &str) -> Vec<TunnelAction> {
        if self.state != TunnelState::Connected {
            return vec![TunnelAction::Discarded(DiscardReason::NotConnected)];
        }
        let msg = match decode_message(text) {
            Ok(m) => m,
            Err(e) => {
                return vec![TunnelAction::Discarded(DiscardReason::Malformed(
                    e.to_string(),
                ))]
            }
        };
        match msg {
            TunnelMessage::Connected { handle } => vec![TunnelAction::Confirmed { handle }],
            TunnelMessage::Request {
                id,
                method,
                path,
                body,
            } => vec![TunnelAction::Dispatch(RelayRequest {
                id,
                method,
                path,
                body,
                generation: self.generation,
            })],
            TunnelMessage::HeartbeatAck {} => {
                self.missed_acks = 0;
                self.ack_deadline = None;
                vec![]
            }
            TunnelMessage::Response { .. } => {
                vec![TunnelAction::Discarded(DiscardReason::Unexpected("response"))]
            }
            TunnelMessage::Heartbeat { .. } => {
                vec![TunnelAction::Discarded(DiscardReason::Unexpected("heartbeat"))]
            }
        }
    }

    /// Drive timers: reconnect while registered and disconnected, keepalive while connected.
    pub fn poll(&mut self, now: Instant) -> Vec<TunnelAction> {
        match self.state {
            TunnelState::Disconnected => {
                if !self.registered || !self.reconnect_due(now) {
                    return vec![];
                }
                let Some(target) = self.target.clone() else {
                    return vec![];
                };
                self.state = TunnelState::Connecting;
                self.last_reconnect_attempt = Some(now);
                vec![TunnelAction::Connect(target)]
            }
            TunnelState::Connecting => vec![],
            TunnelState::Connected => {
                let mut actions = Vec::new();
                if let Some(deadline) = self.ack_deadline {
                    if now >= deadline {
                        self.ack_deadline = None;
                        self.missed_acks = self.missed_acks.saturating_add(1);
                        if self.missed_acks >= self.config.max_missed_acks {
                            self.disconnect(now);
                            actions.push(TunnelAction::Close);
                            return actions;
                        }
                    }
                }
                let due = self.next_keepalive.map(|t| now >= t).unwrap_or(true);
                if due {
                    if let Ok(frame) = encode_message(&TunnelMessage::heartbeat(&self.handle)) {
                        actions.push(TunnelAction::Send(frame));
                    }
                    if self.ack_deadline.is_none() {
                        self.ack_deadline = Some(now + self.config.ack_timeout);
                    }
                    self.next_keepalive = Some(now + self.config.keepalive_interval);
                }
                actions
            }
        }
    }

    /// Frame the executor's reply to `request`. None if the connection it arrived on is gone.
    pub fn respond(&self, request: &RelayRequest, response: &ExecutorResponse) -> Option<String> {
        if self.state != TunnelState::Connected || request.generation != self.generation {
            return None;
        }
        encode_message(&TunnelMessage::response(
            request.id.clone(),
            response.body.clone(),
        ))
        .ok()
    }

    fn reconnect_due(&self, now: Instant) -> bool {
        let last = match (self.last_reconnect_attempt, self.disconnected_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match last {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.config.reconnect_interval,
        }
    }

    fn disconnect(&mut self, now: Instant) {
        self.state = TunnelState::Disconnected;
        self.disconnected_at = Some(now);
        self.next_keepalive = None;
        self.ack_deadline = None;
    }
}
