//! NANDA agent core: identity, registry liveness, peer snapshot and tunnel relay.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod executor;
pub mod identity;
pub mod peers;
pub mod protocol;
pub mod registration;
pub mod status;
pub mod tunnel;
pub mod wire;

pub use executor::{Device, DeviceRouter, ExecutorResponse, LocalRequestExecutor};
pub use identity::{DeviceIdentity, HardwareAddress};
pub use peers::{PeerDirectory, PeerRecord};
pub use protocol::{AgentDescriptor, AgentList, RegistryList, TunnelMessage};
pub use registration::{HeartbeatOutcome, RegistrationState, RegistrationTracker};
pub use status::ConnectivityStatus;
pub use tunnel::{
    RelayRequest, TunnelAction, TunnelConfig, TunnelEvent, TunnelSession, TunnelState,
    TunnelTarget,
};
pub use wire::{decode_message, encode_message, MessageDecodeError, MessageEncodeError};
