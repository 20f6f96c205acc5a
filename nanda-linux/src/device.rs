//! Simulated hardware for hosts without the real sensors.

use std::time::Instant;

use nanda_core::executor::{BatteryStatus, ButtonState, SensorSnapshot, Vector3, WifiNetwork};
use nanda_core::Device;
use rand::Rng;
use tracing::info;

pub struct SimulatedDevice {
    started: Instant,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

fn jitter(rng: &mut impl Rng, center: f32, spread: f32) -> f32 {
    center + rng.gen_range(-spread..=spread)
}

impl Device for SimulatedDevice {
    fn sensors(&self) -> SensorSnapshot {
        let mut rng = rand::thread_rng();
        SensorSnapshot {
            // Resting flat: gravity on z.
            accelerometer: Vector3 {
                x: jitter(&mut rng, 0.0, 0.02),
                y: jitter(&mut rng, 0.0, 0.02),
                z: jitter(&mut rng, 1.0, 0.02),
            },
            gyroscope: Vector3 {
                x: jitter(&mut rng, 0.0, 0.5),
                y: jitter(&mut rng, 0.0, 0.5),
                z: jitter(&mut rng, 0.0, 0.5),
            },
            temperature: jitter(&mut rng, 32.0, 1.5),
            timestamp: self.started.elapsed().as_millis() as u64,
        }
    }

    fn buttons(&self) -> ButtonState {
        ButtonState::default()
    }

    fn battery(&self) -> BatteryStatus {
        let mut rng = rand::thread_rng();
        let voltage = jitter(&mut rng, 3.95, 0.05);
        // 3.3 V empty, 4.2 V full.
        let percent = (((voltage - 3.3) / 0.9) * 100.0).clamp(0.0, 100.0) as u8;
        BatteryStatus {
            voltage,
            percent,
            is_charging: false,
        }
    }

    fn wifi_scan(&self) -> Vec<WifiNetwork> {
        let mut rng = rand::thread_rng();
        let mut nets: Vec<WifiNetwork> = [("nanda-lab", 6u8), ("guest", 1), ("iot-2g", 11)]
            .iter()
            .map(|(ssid, channel)| WifiNetwork {
                ssid: ssid.to_string(),
                rssi: rng.gen_range(-85..=-35),
                channel: *channel,
            })
            .collect();
        nets.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        nets
    }

    fn play_tone(&self, frequency: u32, duration_ms: u32) {
        info!(frequency, duration_ms, "buzzer");
    }

    fn show_text(&self, text: &str) {
        info!(%text, "display");
    }
}
