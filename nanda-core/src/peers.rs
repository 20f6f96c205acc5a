//! Peer directory: bounded snapshot of other registered agents, replaced wholesale on each fetch.

use serde::Serialize;

use crate::protocol::{AgentDescriptor, AgentList};

/// Default number of peers kept in the snapshot.
pub const DEFAULT_PEER_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub handle: String,
    pub url: String,
    pub name: String,
    pub healthy: bool,
}

impl From<AgentDescriptor> for PeerRecord {
    fn from(a: AgentDescriptor) -> Self {
        let name = a
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| a.handle.clone());
        Self {
            handle: a.handle,
            url: a.url,
            name,
            healthy: a.healthy,
        }
    }
}

pub struct PeerDirectory {
    own_handle: String,
    capacity: usize,
    peers: Vec<PeerRecord>,
}

impl PeerDirectory {
    pub fn new(own_handle: impl Into<String>) -> Self {
        Self::with_capacity(own_handle, DEFAULT_PEER_CAPACITY)
    }

    pub fn with_capacity(own_handle: impl Into<String>, capacity: usize) -> Self {
        Self {
            own_handle: own_handle.into(),
            capacity,
            peers: Vec::new(),
        }
    }

    /// Current snapshot in registry order.
    pub fn snapshot(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Replace the snapshot: own handle excluded, truncated to capacity. Returns new length.
    pub fn replace(&mut self, agents: Vec<AgentDescriptor>) -> usize {
        let own = self.own_handle.as_str();
        self.peers = agents
            .into_iter()
            .filter(|a| a.handle != own)
            .take(self.capacity)
            .map(PeerRecord::from)
            .collect();
        self.peers.len()
    }

    /// Parse a `GET /agents` body and replace. On parse error the snapshot is untouched.
    pub fn replace_from_json(&mut self, payload: &str) -> Result<usize, serde_json::Error> {
        let list: AgentList = serde_json::from_str(payload)?;
        Ok(self.replace(list.agents))
    }
}
