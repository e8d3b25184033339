use serde::{Deserialize, Serialize};

use crate::clock::MAX_DEADLINE_SPAN_MS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PumpConfig {
    /// Control loop period; bounds how late an auto-off can fire.
    pub tick_interval_ms: u64,
    pub max_duration_ms: u32,
    pub max_body_bytes: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 200,
            max_duration_ms: MAX_DEADLINE_SPAN_MS,
            max_body_bytes: 1024,
        }
    }
}

impl PumpConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        self.max_duration_ms = self.max_duration_ms.clamp(1_000, MAX_DEADLINE_SPAN_MS);
        self.max_body_bytes = self.max_body_bytes.clamp(64, 4096);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub pump_pin: i32,
    /// Level that energizes the pump relay.
    pub active_high: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            pump_pin: 27,
            active_high: true,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        if !(0..=48).contains(&self.pump_pin) {
            self.pump_pin = 27;
        }
    }

    /// Pin level to write for the requested pump state.
    pub fn pin_level(&self, engaged: bool) -> bool {
        engaged == self.active_high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pump: PumpConfig::default(),
            hardware: HardwareConfig::default(),
            network: NetworkConfig::default(),
            timezone: "Europe/Rome".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.pump.sanitize();
        self.hardware.sanitize();
        if self.network.http_port == 0 {
            self.network.http_port = 80;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut runtime = RuntimeConfig {
            pump: PumpConfig {
                tick_interval_ms: 0,
                max_duration_ms: u32::MAX,
                max_body_bytes: 1,
            },
            hardware: HardwareConfig {
                pump_pin: -1,
                active_high: false,
            },
            network: NetworkConfig {
                http_port: 0,
                ..NetworkConfig::default()
            },
            timezone: "UTC".to_string(),
        };

        runtime.sanitize();

        assert_eq!(runtime.pump.tick_interval_ms, 10);
        assert_eq!(runtime.pump.max_duration_ms, MAX_DEADLINE_SPAN_MS);
        assert_eq!(runtime.pump.max_body_bytes, 64);
        assert_eq!(runtime.hardware.pump_pin, 27);
        assert!(!runtime.hardware.active_high);
        assert_eq!(runtime.network.http_port, 80);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let runtime: RuntimeConfig = serde_json::from_str(r#"{"timezone":"UTC"}"#).unwrap();

        assert_eq!(runtime.pump, PumpConfig::default());
        assert_eq!(runtime.hardware, HardwareConfig::default());
        assert_eq!(runtime.timezone, "UTC");
    }

    #[test]
    fn active_low_relay_inverts_pin_level() {
        let relay = HardwareConfig {
            pump_pin: 27,
            active_high: false,
        };

        assert!(!relay.pin_level(true));
        assert!(relay.pin_level(false));
        assert!(HardwareConfig::default().pin_level(true));
    }
}
