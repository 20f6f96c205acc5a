//! Local request executor: the route table shared by the local HTTP server and the tunnel.
//!
//! The executor knows nothing about the transport a request came from. Hardware access goes
//! through the [`Device`] trait so the routes stay testable without a device attached.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::identity::DeviceIdentity;

pub const DEFAULT_TONE_FREQUENCY: u32 = 1000;
pub const DEFAULT_TONE_DURATION_MS: u32 = 100;
/// Networks listed by the wifi scan route.
pub const MAX_SCAN_RESULTS: usize = 10;

/// Result of executing one request: status and JSON body. Transports add the content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorResponse {
    pub status: u16,
    pub body: String,
}

impl ExecutorResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string(),
        }
    }

    /// Error body echoing the request path.
    pub fn error(status: u16, message: &str, path: &str) -> Self {
        Self::json(status, &json!({ "error": message, "path": path }))
    }
}

/// Given (method, path, body), produce a response. Must not depend on the calling transport.
pub trait LocalRequestExecutor: Send + Sync {
    fn execute(&self, method: &str, path: &str, body: &str) -> ExecutorResponse;
}

impl<T: LocalRequestExecutor + ?Sized> LocalRequestExecutor for Arc<T> {
    fn execute(&self, method: &str, path: &str, body: &str) -> ExecutorResponse {
        (**self).execute(method, path, body)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub accelerometer: Vector3,
    pub gyroscope: Vector3,
    pub temperature: f32,
    /// Milliseconds since the device started.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ButtonState {
    #[serde(rename = "btnA")]
    pub a: bool,
    #[serde(rename = "btnB")]
    pub b: bool,
    #[serde(rename = "btnPwr")]
    pub power: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    pub voltage: f32,
    pub percent: u8,
    pub is_charging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
}

/// Hardware the routes read from and act on.
pub trait Device: Send + Sync {
    fn sensors(&self) -> SensorSnapshot;
    fn buttons(&self) -> ButtonState;
    fn battery(&self) -> BatteryStatus;
    fn wifi_scan(&self) -> Vec<WifiNetwork>;
    fn play_tone(&self, frequency: u32, duration_ms: u32);
    fn show_text(&self, text: &str);
}

const SKILLS: [(&str, &str, &str); 6] = [
    ("sensors/read", "Read Sensors", "Read accelerometer, gyroscope, and temperature"),
    ("display/show", "Show on Display", "Display text on LCD"),
    ("button/status", "Button Status", "Get current button states"),
    ("buzzer/tone", "Play Tone", "Play a tone on the buzzer"),
    ("battery/status", "Battery Status", "Get battery voltage and percentage"),
    ("wifi/scan", "Scan WiFi", "Scan for nearby WiFi networks"),
];

/// Route table over a [`Device`]. Routes match on the path; the method is not considered.
pub struct DeviceRouter<D> {
    identity: DeviceIdentity,
    agent_url: String,
    version: String,
    device: D,
}

impl<D: Device> DeviceRouter<D> {
    pub fn new(
        identity: DeviceIdentity,
        agent_url: impl Into<String>,
        version: impl Into<String>,
        device: D,
    ) -> Self {
        Self {
            identity,
            agent_url: agent_url.into(),
            version: version.into(),
            device,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn agent_card(&self) -> serde_json::Value {
        let skills: Vec<serde_json::Value> = SKILLS
            .iter()
            .map(|(id, name, description)| json!({"id": id, "name": name, "description": description}))
            .collect();
        json!({
            "name": self.identity.display_name(),
            "handle": self.identity.handle(),
            "deviceId": self.identity.full_id(),
            "description": "M5StickC Plus 2 IoT device with sensors, display, IR, and controls",
            "url": self.agent_url,
            "version": self.version,
            "defaultInputModes": [crate::protocol::JSON_CONTENT_TYPE],
            "defaultOutputModes": [crate::protocol::JSON_CONTENT_TYPE],
            "capabilities": {"streaming": false, "pushNotifications": false},
            "skills": skills,
        })
    }

    fn buzzer(&self, query: &str) -> serde_json::Value {
        let frequency = query_param(query, "freq")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_TONE_FREQUENCY);
        let duration = query_param(query, "duration")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_TONE_DURATION_MS);
        self.device.play_tone(frequency, duration);
        json!({"success": true, "frequency": frequency, "duration": duration})
    }

    fn wifi_scan(&self) -> serde_json::Value {
        let networks = self.device.wifi_scan();
        let count = networks.len();
        let listed: Vec<&WifiNetwork> = networks.iter().take(MAX_SCAN_RESULTS).collect();
        json!({"networks": listed, "count": count})
    }
}

fn to_value<T: Serialize>(v: &T) -> serde_json::Value {
    serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
}

/// First value of `key` in a query string, percent-decoded.
fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

impl<D: Device> LocalRequestExecutor for DeviceRouter<D> {
    fn execute(&self, _method: &str, path: &str, _body: &str) -> ExecutorResponse {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        match route {
            "/.well-known/agent.json" => ExecutorResponse::json(200, &self.agent_card()),
            "/api/sensors" => ExecutorResponse::json(200, &to_value(&self.device.sensors())),
            "/api/buttons" => ExecutorResponse::json(200, &to_value(&self.device.buttons())),
            "/api/battery" => ExecutorResponse::json(200, &to_value(&self.device.battery())),
            "/api/wifi/scan" => ExecutorResponse::json(200, &self.wifi_scan()),
            r if r.starts_with("/api/buzzer") => ExecutorResponse::json(200, &self.buzzer(query)),
            r if r.starts_with("/api/display") => match query_param(query, "text") {
                Some(text) => {
                    self.device.show_text(&text);
                    ExecutorResponse::json(200, &json!({"success": true, "displayed": text}))
                }
                None => ExecutorResponse::error(400, "Missing text parameter", path),
            },
            _ => ExecutorResponse::error(404, "Not found", path),
        }
    }
}
