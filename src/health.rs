//! Link health bookkeeping and the periodic health classification.
//!
//! [`LinkHealth`] is the one piece of state shared across tasks. Each field
//! has a single writer:
//!
//! - link manager: `wifi_connected`
//! - publisher: broker session and publish counters
//! - acquisition task: per-sensor counters and `last_read_time`
//!
//! The health monitor only reads. The re-association request is the one
//! flag touched by two tasks and is handed over with an atomic swap.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{error, info, warn};

use crate::sensor::{SensorIndex, MAX_SENSORS};

#[derive(Debug, Default)]
struct SensorCounters {
    consecutive_faults: AtomicU32,
    total_faults: AtomicU32,
    total_reads: AtomicU64,
}

#[derive(Debug, Default)]
pub struct LinkHealth {
    wifi_connected: AtomicBool,
    broker_connected: AtomicBool,
    broker_changed_at: AtomicU64,
    consecutive_failures: AtomicU32,
    total_publish_failures: AtomicU32,
    last_successful_publish_time: AtomicU64,
    last_read_time: AtomicU64,
    sensors: [SensorCounters; MAX_SENSORS],
    reassociate_requested: AtomicBool,
}

/// Point-in-time copy of [`LinkHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub wifi_connected: bool,
    pub broker_connected: bool,
    pub broker_changed_at: u64,
    pub consecutive_failures: u32,
    pub total_publish_failures: u32,
    pub last_successful_publish_time: u64,
    pub last_read_time: u64,
    pub sensor_consecutive_faults: [u32; MAX_SENSORS],
    pub sensor_total_faults: [u32; MAX_SENSORS],
}

impl HealthSnapshot {
    pub fn max_consecutive_sensor_faults(&self) -> u32 {
        self.sensor_consecutive_faults.iter().copied().max().unwrap_or(0)
    }

    /// Sensor faults plus publish failures since boot.
    pub fn cumulative_failures(&self) -> u32 {
        self.sensor_total_faults
            .iter()
            .fold(self.total_publish_failures, |acc, n| acc.saturating_add(*n))
    }
}

impl LinkHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wifi_connected(&self) -> bool {
        self.wifi_connected.load(Ordering::Acquire)
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Acquire)
    }

    // Link manager side.

    pub fn set_wifi_connected(&self, connected: bool) {
        self.wifi_connected.store(connected, Ordering::Release);
    }

    pub fn take_reassociate_request(&self) -> bool {
        self.reassociate_requested.swap(false, Ordering::AcqRel)
    }

    // Publisher side.

    pub fn set_broker_connected(&self, connected: bool, now: u64) {
        if self.broker_connected.swap(connected, Ordering::AcqRel) != connected {
            self.broker_changed_at.store(now, Ordering::Release);
        }
    }

    pub fn record_publish_success(&self, now: u64) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_successful_publish_time.store(now, Ordering::Release);
    }

    pub fn record_publish_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.total_publish_failures.fetch_add(1, Ordering::AcqRel);
    }

    // Acquisition side.

    pub fn record_sensor_read(&self, sensor: SensorIndex, now: u64) {
        if let Some(counters) = self.sensors.get(sensor) {
            counters.consecutive_faults.store(0, Ordering::Release);
            counters.total_reads.fetch_add(1, Ordering::AcqRel);
        }
        self.last_read_time.store(now, Ordering::Release);
    }

    /// Returns the sensor's consecutive fault count including this one.
    pub fn record_sensor_fault(&self, sensor: SensorIndex) -> u32 {
        self.sensors.get(sensor).map_or(0, |counters| {
            counters.total_faults.fetch_add(1, Ordering::AcqRel);
            counters.consecutive_faults.fetch_add(1, Ordering::AcqRel) + 1
        })
    }

    pub fn sensor_reads(&self, sensor: SensorIndex) -> u64 {
        self.sensors
            .get(sensor)
            .map_or(0, |c| c.total_reads.load(Ordering::Acquire))
    }

    // Health monitor side.

    pub fn request_reassociation(&self) {
        self.reassociate_requested.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut sensor_consecutive_faults = [0; MAX_SENSORS];
        let mut sensor_total_faults = [0; MAX_SENSORS];
        for (i, counters) in self.sensors.iter().enumerate() {
            sensor_consecutive_faults[i] = counters.consecutive_faults.load(Ordering::Acquire);
            sensor_total_faults[i] = counters.total_faults.load(Ordering::Acquire);
        }

        HealthSnapshot {
            wifi_connected: self.wifi_connected(),
            broker_connected: self.broker_connected(),
            broker_changed_at: self.broker_changed_at.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_publish_failures: self.total_publish_failures.load(Ordering::Acquire),
            last_successful_publish_time: self.last_successful_publish_time.load(Ordering::Acquire),
            last_read_time: self.last_read_time.load(Ordering::Acquire),
            sensor_consecutive_faults,
            sensor_total_faults,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl core::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// A sensor is critical once its consecutive faults exceed this cap.
    pub max_consecutive_sensor_faults: u32,
    /// How long the broker may stay disconnected before it is critical.
    pub broker_grace_ms: u64,
    /// Consecutive critical evaluations before a restart is requested.
    pub critical_restart_after: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_sensor_faults: 5,
            broker_grace_ms: 30_000,
            critical_restart_after: 3,
        }
    }
}

pub fn classify(snapshot: &HealthSnapshot, thresholds: &HealthThresholds, now: u64) -> HealthStatus {
    let broker_down_for = if snapshot.broker_connected {
        0
    } else {
        now.saturating_sub(snapshot.broker_changed_at)
    };

    if snapshot.max_consecutive_sensor_faults() > thresholds.max_consecutive_sensor_faults
        || broker_down_for > thresholds.broker_grace_ms
    {
        return HealthStatus::Critical;
    }

    // Sensor faults at or below the cap do not degrade the node.
    if !snapshot.wifi_connected || !snapshot.broker_connected || snapshot.consecutive_failures > 0 {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}

/// Periodic status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: HealthStatus,
    pub failures: u32,
    #[serde(rename = "lastRead")]
    pub last_read: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryActions {
    pub publish_status: bool,
    pub force_reassociation: bool,
    pub request_restart: bool,
}

impl RecoveryActions {
    pub fn has_escalation(&self) -> bool {
        self.force_reassociation || self.request_restart
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthAssessment {
    pub status: HealthStatus,
    pub report: StatusReport,
    pub actions: RecoveryActions,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub evaluations: u32,
    pub degraded_evaluations: u32,
    pub critical_evaluations: u32,
    pub reassociations_requested: u32,
    pub restarts_requested: u32,
}

#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    last_status: HealthStatus,
    consecutive_critical: u32,
    stats: MonitorStats,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            last_status: HealthStatus::Healthy,
            consecutive_critical: 0,
            stats: MonitorStats::default(),
        }
    }

    /// `to_epoch` converts device time into the timestamp reported as `lastRead`.
    pub fn evaluate(
        &mut self,
        snapshot: &HealthSnapshot,
        now: u64,
        to_epoch: impl Fn(u64) -> u64,
    ) -> HealthAssessment {
        let status = classify(snapshot, &self.thresholds, now);
        self.stats.evaluations = self.stats.evaluations.saturating_add(1);

        let mut actions = RecoveryActions {
            publish_status: true,
            ..RecoveryActions::default()
        };

        match status {
            HealthStatus::Healthy => {
                self.consecutive_critical = 0;
            }
            HealthStatus::Degraded => {
                self.consecutive_critical = 0;
                self.stats.degraded_evaluations += 1;
            }
            HealthStatus::Critical => {
                self.consecutive_critical += 1;
                self.stats.critical_evaluations += 1;

                actions.force_reassociation = true;
                self.stats.reassociations_requested += 1;

                if self.consecutive_critical >= self.thresholds.critical_restart_after {
                    actions.request_restart = true;
                    self.stats.restarts_requested += 1;
                    error!(
                        evaluations = self.consecutive_critical,
                        "critical state persisted, requesting restart"
                    );
                }
            }
        }

        if status != self.last_status {
            match status {
                HealthStatus::Healthy => info!(from = %self.last_status, "health recovered"),
                HealthStatus::Degraded => warn!(from = %self.last_status, "health degraded"),
                HealthStatus::Critical => error!(
                    from = %self.last_status,
                    sensor_faults = snapshot.max_consecutive_sensor_faults(),
                    broker_connected = snapshot.broker_connected,
                    "health critical"
                ),
            }
            self.last_status = status;
        }

        let last_read = if snapshot.last_read_time == 0 {
            0
        } else {
            to_epoch(snapshot.last_read_time)
        };

        HealthAssessment {
            status,
            report: StatusReport {
                status,
                failures: snapshot.cumulative_failures(),
                last_read,
            },
            actions,
        }
    }

    pub fn last_status(&self) -> HealthStatus {
        self.last_status
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_grace_period() {
        let health = LinkHealth::new();
        health.set_wifi_connected(true);
        health.set_broker_connected(true, 1_000);
        health.set_broker_connected(false, 2_000);

        let thresholds = HealthThresholds::default();
        let snapshot = health.snapshot();
        assert_eq!(classify(&snapshot, &thresholds, 2_000 + 30_000), HealthStatus::Degraded);
        assert_eq!(classify(&snapshot, &thresholds, 2_000 + 30_001), HealthStatus::Critical);
    }

    #[test]
    fn test_sensor_fault_counters() {
        let health = LinkHealth::new();
        assert_eq!(health.record_sensor_fault(1), 1);
        assert_eq!(health.record_sensor_fault(1), 2);
        health.record_sensor_read(1, 40);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.sensor_consecutive_faults[1], 0);
        assert_eq!(snapshot.sensor_total_faults[1], 2);
        assert_eq!(snapshot.last_read_time, 40);
        assert_eq!(snapshot.cumulative_failures(), 2);
    }

    #[test]
    fn test_reassociation_handover() {
        let health = LinkHealth::new();
        assert!(!health.take_reassociate_request());
        health.request_reassociation();
        assert!(health.take_reassociate_request());
        assert!(!health.take_reassociate_request());
    }

    #[test]
    fn test_status_report_serialization() {
        let report = StatusReport {
            status: HealthStatus::Degraded,
            failures: 3,
            last_read: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"status":"degraded","failures":3,"lastRead":1700000000000}"#);
    }
}
