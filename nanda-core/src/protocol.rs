//! Message types: tunnel frames and the coordination service REST bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Path of the tunnel endpoint on the coordination service.
pub const TUNNEL_PATH: &str = "/tunnel";

/// Content type of every relayed response.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Tunnel frames. One JSON object per text frame, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Server confirms the session; carries its view of our handle.
    Connected {
        #[serde(default)]
        handle: Option<String>,
    },
    /// Relayed HTTP-style request. Correlated only by `id`.
    Request {
        #[serde(default)]
        id: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default = "default_path")]
        path: String,
        #[serde(default, deserialize_with = "body_as_text")]
        body: String,
    },
    /// Reply to a relayed request, echoing its `id`.
    Response {
        id: String,
        status: u16,
        headers: BTreeMap<String, String>,
        body: String,
    },
    /// Session keepalive sent by the agent.
    Heartbeat { handle: String },
    /// Acknowledges a keepalive.
    HeartbeatAck {},
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// Request bodies arrive as strings; anything else is re-serialized, null is empty.
fn body_as_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Explicit `null` takes the field's default, same as a missing key.
fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

impl TunnelMessage {
    /// Build the response frame for a relayed request.
    pub fn response(id: impl Into<String>, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), JSON_CONTENT_TYPE.to_string());
        TunnelMessage::Response {
            id: id.into(),
            status: 200,
            headers,
            body: body.into(),
        }
    }

    pub fn heartbeat(handle: impl Into<String>) -> Self {
        TunnelMessage::Heartbeat {
            handle: handle.into(),
        }
    }
}

/// `POST /agents` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
    pub url: String,
}

/// `POST /heartbeat` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub handle: String,
    pub status: String,
}

impl HeartbeatRequest {
    pub fn healthy(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            status: "healthy".to_string(),
        }
    }
}

/// One entry of `GET /agents`. Missing or null fields take their empty defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(default, deserialize_with = "null_as_default")]
    pub handle: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub healthy: bool,
}

/// `GET /agents` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentList {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// Entry of the public registry list document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryListEntry {
    #[serde(default)]
    pub url: String,
}

/// Public registry list document: `{"registries":[{"url":...}, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryList {
    #[serde(default)]
    pub registries: Vec<RegistryListEntry>,
}

impl RegistryList {
    /// URL of the first entry, if it has one.
    pub fn first_url(&self) -> Option<&str> {
        self.registries
            .first()
            .map(|e| e.url.as_str())
            .filter(|u| !u.is_empty())
    }
}
