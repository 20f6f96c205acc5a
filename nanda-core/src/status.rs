//! Connectivity signal for the display layer.

use serde::Serialize;

use crate::registration::RegistrationState;
use crate::tunnel::TunnelState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityStatus {
    pub registry_url: Option<String>,
    pub registration: RegistrationState,
    pub tunnel: TunnelState,
    pub peer_count: usize,
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self {
            registry_url: None,
            registration: RegistrationState::Unregistered,
            tunnel: TunnelState::Disconnected,
            peer_count: 0,
        }
    }
}

impl ConnectivityStatus {
    /// No registry reachable: device keeps serving local requests only.
    pub fn is_standalone(&self) -> bool {
        self.registration != RegistrationState::Registered
    }
}
