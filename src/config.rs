//! Node configuration, loaded once at boot from a JSON file.
//!
//! Every section falls back to its defaults when omitted, so a file only
//! needs to name what differs from the stock two-sensor node.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::aggregator::DEFAULT_WINDOW_SIZE;
use crate::bus::BusTiming;
use crate::error::ConfigError;
use crate::health::HealthThresholds;
use crate::publisher::Topics;
use crate::reconnect::ReconnectPolicy;
use crate::sensor::{DeviceAddress, MAX_SENSORS};

/// Highest unicast address on the field bus.
const MAX_BUS_ID: u8 = 247;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl core::fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(flatten)]
    pub credentials: NetworkCredentials,
    pub association_timeout_ms: u64,
    pub service_period_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            credentials: NetworkCredentials {
                ssid: "vibemon".into(),
                password: String::new(),
            },
            association_timeout_ms: 10_000,
            service_period_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub telemetry_topic: String,
    pub status_topic: String,
    pub keep_alive_s: u16,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "vibemon-node".into(),
            telemetry_topic: "vibemon/telemetry".into(),
            status_topic: "vibemon/status".into(),
            keep_alive_s: 60,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    pub turnaround_us: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9_600,
            response_timeout_ms: 100,
            turnaround_us: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Samples per batch. Also the number of readings the inference service
    /// expects per request.
    pub window_size: u32,
    pub sample_period_ms: u64,
    /// Batches held by the publisher while the broker is unreachable.
    pub queue_capacity: usize,
    /// Hand-off channel between acquisition and publisher.
    pub channel_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            sample_period_ms: 10,
            queue_capacity: 8,
            channel_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub period_ms: u64,
    pub max_consecutive_sensor_faults: u32,
    pub broker_grace_ms: u64,
    pub critical_restart_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let thresholds = HealthThresholds::default();
        Self {
            period_ms: 5_000,
            max_consecutive_sensor_faults: thresholds.max_consecutive_sensor_faults,
            broker_grace_ms: thresholds.broker_grace_ms,
            critical_restart_after: thresholds.critical_restart_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub deadline_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { deadline_ms: 2_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    pub bus: BusConfig,
    pub sensors: Vec<DeviceAddress>,
    pub acquisition: AcquisitionConfig,
    pub reconnect: ReconnectPolicy,
    pub health: HealthConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            broker: BrokerConfig::default(),
            bus: BusConfig::default(),
            sensors: vec![DeviceAddress::new(0x01), DeviceAddress::new(0x02)],
            acquisition: AcquisitionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            health: HealthConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.acquisition.window_size == 0 {
            return invalid("acquisition.window_size must be at least 1".into());
        }
        if self.acquisition.sample_period_ms == 0 {
            return invalid("acquisition.sample_period_ms must be at least 1".into());
        }
        if self.acquisition.queue_capacity == 0 || self.acquisition.channel_capacity == 0 {
            return invalid("queue and channel capacities must be at least 1".into());
        }

        if self.sensors.is_empty() || self.sensors.len() > MAX_SENSORS {
            return invalid(format!("between 1 and {} sensors required", MAX_SENSORS));
        }
        for (i, sensor) in self.sensors.iter().enumerate() {
            if sensor.bus_id == 0 || sensor.bus_id > MAX_BUS_ID {
                return invalid(format!("sensor {} bus id {} out of range", i, sensor.bus_id));
            }
            if self.sensors[..i].iter().any(|other| other.bus_id == sensor.bus_id) {
                return invalid(format!("sensor bus id {} used twice", sensor.bus_id));
            }
            if sensor.register_count < 3 {
                return invalid(format!("sensor {} must expose three axis registers", i));
            }
        }

        if self.network.credentials.ssid.is_empty() {
            return invalid("network.ssid must not be empty".into());
        }
        if self.broker.port == 0 {
            return invalid("broker.port must not be 0".into());
        }
        if self.broker.telemetry_topic.is_empty() || self.broker.status_topic.is_empty() {
            return invalid("broker topics must not be empty".into());
        }
        if self.bus.baud_rate == 0 {
            return invalid("bus.baud_rate must not be 0".into());
        }

        if self.reconnect.max_attempts == 0 {
            return invalid("reconnect.max_attempts must be at least 1".into());
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return invalid("reconnect.initial_backoff_ms exceeds max_backoff_ms".into());
        }

        if self.health.period_ms == 0 {
            return invalid("health.period_ms must be at least 1".into());
        }
        if self.watchdog.deadline_ms <= self.acquisition.sample_period_ms {
            return invalid("watchdog.deadline_ms must exceed the sample period".into());
        }

        Ok(())
    }

    pub fn bus_timing(&self) -> BusTiming {
        BusTiming::for_baud(
            self.bus.baud_rate,
            Duration::from_millis(self.bus.response_timeout_ms),
            Duration::from_micros(self.bus.turnaround_us),
        )
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            max_consecutive_sensor_faults: self.health.max_consecutive_sensor_faults,
            broker_grace_ms: self.health.broker_grace_ms,
            critical_restart_after: self.health.critical_restart_after,
        }
    }

    pub fn topics(&self) -> Topics {
        Topics {
            telemetry: self.broker.telemetry_topic.clone(),
            status: self.broker.status_topic.clone(),
        }
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.acquisition.sample_period_ms)
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_millis(self.health.period_ms)
    }

    pub fn link_service_period(&self) -> Duration {
        Duration::from_millis(self.network.service_period_ms.max(1))
    }

    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.network.association_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.window_size, 24);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[1].bus_id, 0x02);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{
                "network": { "ssid": "plant-floor", "password": "s3cret" },
                "acquisition": { "window_size": 32 },
                "reconnect": { "max_attempts": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.network.credentials.ssid, "plant-floor");
        assert_eq!(config.network.service_period_ms, 250);
        assert_eq!(config.acquisition.window_size, 32);
        assert_eq!(config.acquisition.sample_period_ms, 10);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_rejects_duplicate_sensor_ids() {
        let err = NodeConfig::from_json_str(
            r#"{ "sensors": [ { "bus_id": 5, "first_register": 0 }, { "bus_id": 5, "first_register": 0 } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_window() {
        let mut config = NodeConfig::default();
        config.acquisition.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let config = NodeConfig::from_json_str(r#"{ "network": { "ssid": "a", "password": "hunter2" } }"#).unwrap();
        let dump = format!("{:?}", config);
        assert!(!dump.contains("hunter2"));
    }
}
