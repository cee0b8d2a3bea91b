//! Task table and task bodies.
//!
//! Acquisition owns core 0 as a plain OS thread with a deadline-based period.
//! Everything network-facing runs as tokio tasks on the runtime bound to
//! core 1 and talks to acquisition only through the batch channel and
//! [`LinkHealth`].

use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregatedBatch, SampleAggregator};
use crate::bus::FieldBus;
use crate::clock::{MonotonicClock, TimeBase};
use crate::config::NodeConfig;
use crate::health::{HealthMonitor, LinkHealth, MonitorStats, StatusReport};
use crate::link::{NetworkInterface, NetworkLinkManager};
use crate::publisher::{BrokerSession, PublisherStats, TelemetryPublisher};
use crate::sensor::{SensorReader, MAX_SENSORS};
use crate::watchdog::{RestartReason, Watchdog};

pub type CoreId = u8;

pub const ACQUISITION_CORE: CoreId = 0;
pub const NETWORK_CORE: CoreId = 1;

/// Declared placement and period of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub name: &'static str,
    pub core: CoreId,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskTable {
    pub acquisition: TaskSpec,
    pub link: TaskSpec,
    pub publisher: TaskSpec,
    pub health: TaskSpec,
    pub watchdog: TaskSpec,
}

impl TaskTable {
    pub fn from_config(config: &NodeConfig) -> Self {
        let link_period = config.link_service_period();
        Self {
            acquisition: TaskSpec {
                name: "acquisition",
                core: ACQUISITION_CORE,
                period: config.sample_period(),
            },
            link: TaskSpec {
                name: "link",
                core: NETWORK_CORE,
                period: link_period,
            },
            publisher: TaskSpec {
                name: "publisher",
                core: NETWORK_CORE,
                period: link_period,
            },
            health: TaskSpec {
                name: "health",
                core: NETWORK_CORE,
                period: config.health_period(),
            },
            watchdog: TaskSpec {
                name: "watchdog",
                core: NETWORK_CORE,
                period: Duration::from_millis((config.watchdog.deadline_ms / 4).max(1)),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSpec> {
        [
            &self.acquisition,
            &self.link,
            &self.publisher,
            &self.health,
            &self.watchdog,
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub cycles: u64,
    pub samples: u64,
    pub sensor_faults: u64,
    pub batches_sent: u32,
    /// Batches lost because the publisher channel was full or closed.
    pub batches_dropped: u32,
    pub fault_flushes: u32,
    pub overruns: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub samples: u8,
    pub faults: u8,
    pub batches: u8,
    pub dropped: u8,
}

/// Per-period body of the acquisition loop.
pub struct AcquisitionTask<B> {
    reader: SensorReader<B>,
    aggregators: Vec<SampleAggregator, MAX_SENSORS>,
    batches: mpsc::Sender<AggregatedBatch>,
    health: Arc<LinkHealth>,
    fault_cap: u32,
    stats: AcquisitionStats,
}

impl<B: FieldBus> AcquisitionTask<B> {
    /// `fault_cap` is the consecutive-fault count past which a sensor's open
    /// window is flushed as partial.
    pub fn new(
        reader: SensorReader<B>,
        window_size: u32,
        fault_cap: u32,
        batches: mpsc::Sender<AggregatedBatch>,
        health: Arc<LinkHealth>,
    ) -> Self {
        let aggregators = (0..reader.device_count())
            .map(|sensor| SampleAggregator::new(sensor, window_size))
            .collect();
        Self {
            reader,
            aggregators,
            batches,
            health,
            fault_cap,
            stats: AcquisitionStats::default(),
        }
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    pub fn aggregator(&self, sensor: usize) -> Option<&SampleAggregator> {
        self.aggregators.get(sensor)
    }

    pub fn reader(&self) -> &SensorReader<B> {
        &self.reader
    }

    /// Reads every sensor once. A fault touches only that sensor's counters.
    pub fn run_cycle(&mut self, now: u64) -> CycleReport {
        let mut report = CycleReport::default();
        self.stats.cycles += 1;

        for sensor in 0..self.aggregators.len() {
            match self.reader.read(sensor, now) {
                Ok(sample) => {
                    self.health.record_sensor_read(sensor, now);
                    self.stats.samples += 1;
                    report.samples += 1;

                    if let Some(batch) = self.aggregators[sensor].push(sample) {
                        self.hand_off(batch, &mut report);
                    }
                }
                Err(fault) => {
                    let consecutive = self.health.record_sensor_fault(sensor);
                    self.stats.sensor_faults += 1;
                    report.faults += 1;
                    debug!(%fault, consecutive, "sample skipped");

                    if consecutive == self.fault_cap.saturating_add(1) {
                        if let Some(batch) = self.aggregators[sensor].flush() {
                            warn!(sensor, samples = batch.sample_count, "prolonged fault, flushing open window");
                            self.stats.fault_flushes += 1;
                            self.hand_off(batch, &mut report);
                        }
                    }
                }
            }
        }

        report
    }

    /// Emits every open window as partial.
    pub fn flush(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for sensor in 0..self.aggregators.len() {
            if let Some(batch) = self.aggregators[sensor].flush() {
                self.hand_off(batch, &mut report);
            }
        }
        report
    }

    fn hand_off(&mut self, batch: AggregatedBatch, report: &mut CycleReport) {
        match self.batches.try_send(batch) {
            Ok(()) => {
                self.stats.batches_sent += 1;
                report.batches += 1;
            }
            Err(mpsc::error::TrySendError::Full(batch)) => {
                self.stats.batches_dropped += 1;
                report.dropped += 1;
                warn!(sensor = batch.sensor, "publisher channel full, batch dropped");
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                self.stats.batches_dropped += 1;
                report.dropped += 1;
                debug!(sensor = batch.sensor, "publisher gone, batch dropped");
            }
        }
    }
}

impl<B: FieldBus + Send + 'static> AcquisitionTask<B> {
    /// Starts the loop on its own thread. It runs until `stop` is set, then
    /// flushes open windows and returns its counters.
    pub fn spawn(
        self,
        spec: TaskSpec,
        clock: MonotonicClock,
        watchdog: Arc<Watchdog>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<AcquisitionStats>> {
        std::thread::Builder::new()
            .name(format!("{}-core{}", spec.name, spec.core))
            .spawn(move || self.run(spec, clock, &watchdog, &stop))
    }

    fn run(mut self, spec: TaskSpec, clock: MonotonicClock, watchdog: &Watchdog, stop: &AtomicBool) -> AcquisitionStats {
        info!(core = spec.core, period_ms = spec.period.as_millis() as u64, "acquisition started");
        let mut next_wake = Instant::now();

        while !stop.load(Ordering::Acquire) {
            let now = clock.now_ms();
            self.run_cycle(now);
            watchdog.kick(now);

            next_wake += spec.period;
            let after = Instant::now();
            if after >= next_wake {
                self.stats.overruns += 1;
                next_wake = after;
            } else {
                std::thread::sleep(next_wake - after);
            }
        }

        self.flush();
        info!(cycles = self.stats.cycles, samples = self.stats.samples, "acquisition stopped");
        self.stats
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Services the wireless link until shutdown.
pub async fn run_link_manager<N: NetworkInterface>(
    mut manager: NetworkLinkManager<N>,
    spec: TaskSpec,
    clock: MonotonicClock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(spec.period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                manager.service(clock.now_ms()).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(stats = ?manager.machine().stats(), "link manager stopped");
}

/// Drains batches and status reports into the broker and keeps the session
/// alive. Batches still in the channel at shutdown get one last send attempt.
pub async fn run_publisher<S: BrokerSession>(
    mut publisher: TelemetryPublisher<S>,
    spec: TaskSpec,
    clock: MonotonicClock,
    mut batches: mpsc::Receiver<AggregatedBatch>,
    mut status: mpsc::Receiver<StatusReport>,
    mut shutdown: watch::Receiver<bool>,
) -> PublisherStats {
    let mut interval = ticker(spec.period);
    loop {
        tokio::select! {
            Some(batch) = batches.recv() => {
                publisher.submit(batch, clock.now_ms()).await;
            }
            Some(report) = status.recv() => {
                if let Err(fault) = publisher.publish_status(&report, clock.now_ms()).await {
                    debug!(%fault, "status report not delivered");
                }
            }
            _ = interval.tick() => {
                let now = clock.now_ms();
                publisher.service_session(now).await;
                publisher.flush_queue(now).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    batches.close();
    while let Ok(batch) = batches.try_recv() {
        publisher.enqueue(batch);
    }
    let sent = publisher.flush_queue(clock.now_ms()).await;
    info!(sent, left = publisher.queue().len(), "publisher stopped");
    *publisher.stats()
}

/// Periodic health evaluation and the only escalation path.
#[allow(clippy::too_many_arguments)]
pub async fn run_health_monitor(
    mut monitor: HealthMonitor,
    spec: TaskSpec,
    clock: MonotonicClock,
    time_base: TimeBase,
    health: Arc<LinkHealth>,
    status: mpsc::Sender<StatusReport>,
    watchdog: Arc<Watchdog>,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorStats {
    let mut interval = ticker(spec.period);
    // First tick fires immediately; judge only after one full period.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = clock.now_ms();
                let assessment = monitor.evaluate(&health.snapshot(), now, |t| time_base.to_epoch(t));

                if assessment.actions.publish_status && status.try_send(assessment.report).is_err() {
                    debug!("status channel full, report skipped");
                }
                if assessment.actions.force_reassociation {
                    health.request_reassociation();
                }
                if assessment.actions.request_restart {
                    watchdog.request_restart(RestartReason::HealthCritical);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    *monitor.stats()
}

/// Checks the acquisition heartbeat; returns once a restart has been raised.
pub async fn run_watchdog(
    watchdog: Arc<Watchdog>,
    spec: TaskSpec,
    clock: MonotonicClock,
    mut shutdown: watch::Receiver<bool>,
) -> Option<RestartReason> {
    let mut interval = ticker(spec.period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(reason) = watchdog.check(clock.now_ms()) {
                    error!(%reason, "watchdog deadline missed");
                    return Some(reason);
                }
            }
            _ = shutdown.changed() => return None,
        }
    }
}
