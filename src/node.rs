//! Node wiring and the restart supervisor.
//!
//! One [`Node`] is one boot: it owns its clock, its shared health block and
//! its watchdog. A watchdog restart tears every task down and the supervisor
//! builds a fresh node from configuration, so nothing in memory survives.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::bus::FieldBus;
use crate::clock::{MonotonicClock, TimeBase};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::health::{HealthMonitor, LinkHealth, MonitorStats};
use crate::link::{NetworkInterface, NetworkLinkManager};
use crate::publisher::{BrokerSession, PublisherStats, TelemetryPublisher};
use crate::scheduler::{
    run_health_monitor, run_link_manager, run_publisher, run_watchdog, AcquisitionStats, AcquisitionTask,
    TaskTable,
};
use crate::sensor::SensorReader;
use crate::watchdog::{RestartReason, Watchdog};

const STATUS_CHANNEL_CAPACITY: usize = 4;

/// Device handles for one boot.
pub struct Hardware<B, N, S> {
    pub bus: B,
    pub wifi: N,
    pub broker: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeExit {
    Restart(RestartReason),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeSummary {
    pub uptime_ms: u64,
    pub acquisition: AcquisitionStats,
    pub publisher: PublisherStats,
    pub monitor: MonitorStats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunOutcome {
    pub exit: NodeExit,
    pub summary: NodeSummary,
}

pub struct Node<B, N, S> {
    config: NodeConfig,
    hardware: Hardware<B, N, S>,
    clock: MonotonicClock,
    time_base: TimeBase,
    health: Arc<LinkHealth>,
    watchdog: Arc<Watchdog>,
}

impl<B, N, S> Node<B, N, S>
where
    B: FieldBus + Send + 'static,
    N: NetworkInterface + 'static,
    S: BrokerSession + 'static,
{
    pub fn new(config: NodeConfig, hardware: Hardware<B, N, S>, time_base: TimeBase) -> Result<Self, NodeError> {
        config.validate()?;
        let clock = MonotonicClock::start();
        let watchdog = Arc::new(Watchdog::new(config.watchdog.deadline_ms, clock.now_ms()));
        Ok(Self {
            config,
            hardware,
            clock,
            time_base,
            health: Arc::new(LinkHealth::new()),
            watchdog,
        })
    }

    pub fn health(&self) -> Arc<LinkHealth> {
        Arc::clone(&self.health)
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        Arc::clone(&self.watchdog)
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    /// Runs until `shutdown` flips to true or a restart is requested.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RunOutcome, NodeError> {
        let Node {
            config,
            hardware,
            clock,
            time_base,
            health,
            watchdog,
        } = self;

        let table = TaskTable::from_config(&config);
        for spec in table.iter() {
            info!(task = spec.name, core = spec.core, period_ms = spec.period.as_millis() as u64, "task declared");
        }

        let (batch_tx, batch_rx) = mpsc::channel(config.acquisition.channel_capacity);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_acquisition = Arc::new(AtomicBool::new(false));

        let reader = SensorReader::new(hardware.bus, &config.sensors);
        let acquisition = AcquisitionTask::new(
            reader,
            config.acquisition.window_size,
            config.health.max_consecutive_sensor_faults,
            batch_tx,
            Arc::clone(&health),
        );
        let acquisition = acquisition.spawn(
            table.acquisition,
            clock,
            Arc::clone(&watchdog),
            Arc::clone(&stop_acquisition),
        )?;

        let link = NetworkLinkManager::new(
            hardware.wifi,
            config.network.credentials.clone(),
            config.reconnect,
            config.association_timeout(),
            Arc::clone(&health),
        );
        let link_task = tokio::spawn(run_link_manager(link, table.link, clock, stop_rx.clone()));

        let publisher = TelemetryPublisher::new(
            hardware.broker,
            config.broker.client_id.clone(),
            config.topics(),
            config.reconnect,
            config.acquisition.queue_capacity,
            time_base,
            Arc::clone(&health),
        );
        let publisher_task = tokio::spawn(run_publisher(
            publisher,
            table.publisher,
            clock,
            batch_rx,
            status_rx,
            stop_rx.clone(),
        ));

        let monitor_task = tokio::spawn(run_health_monitor(
            HealthMonitor::new(config.health_thresholds()),
            table.health,
            clock,
            time_base,
            Arc::clone(&health),
            status_tx,
            Arc::clone(&watchdog),
            stop_rx.clone(),
        ));
        let watchdog_task = tokio::spawn(run_watchdog(Arc::clone(&watchdog), table.watchdog, clock, stop_rx));

        let exit = tokio::select! {
            reason = watchdog.wait_for_restart() => NodeExit::Restart(reason),
            _ = shutdown_requested(shutdown) => NodeExit::Shutdown,
        };
        info!(?exit, "stopping tasks");

        // Acquisition stops first so its final partial windows reach the
        // publisher before the publisher drains.
        stop_acquisition.store(true, Ordering::Release);
        let join_limit = Duration::from_millis(config.watchdog.deadline_ms.saturating_mul(2));
        let acquisition = match tokio::time::timeout(join_limit, tokio::task::spawn_blocking(move || acquisition.join())).await {
            Ok(Ok(Ok(stats))) => stats,
            Ok(Ok(Err(_))) => return Err(NodeError::Task("acquisition thread panicked".into())),
            Ok(Err(e)) => return Err(NodeError::Task(e.to_string())),
            Err(_) => {
                error!("acquisition thread did not stop, abandoning it");
                AcquisitionStats::default()
            }
        };

        let _ = stop_tx.send(true);
        let publisher = publisher_task.await.map_err(|e| NodeError::Task(e.to_string()))?;
        let monitor = monitor_task.await.map_err(|e| NodeError::Task(e.to_string()))?;
        link_task.await.map_err(|e| NodeError::Task(e.to_string()))?;
        watchdog_task.await.map_err(|e| NodeError::Task(e.to_string()))?;

        Ok(RunOutcome {
            exit,
            summary: NodeSummary {
                uptime_ms: clock.now_ms(),
                acquisition,
                publisher,
                monitor,
            },
        })
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorReport {
    pub restarts: u32,
    pub runs: Vec<NodeSummary>,
}

/// Boots nodes until shutdown. `build` is called for every boot and must
/// return fresh device handles.
pub async fn supervise<B, N, S, F>(
    config: NodeConfig,
    mut build: F,
    shutdown: watch::Receiver<bool>,
) -> Result<SupervisorReport, NodeError>
where
    B: FieldBus + Send + 'static,
    N: NetworkInterface + 'static,
    S: BrokerSession + 'static,
    F: FnMut(&NodeConfig) -> Result<Hardware<B, N, S>, NodeError>,
{
    let mut report = SupervisorReport::default();

    loop {
        let hardware = build(&config)?;
        let node = Node::new(config.clone(), hardware, TimeBase::from_system_time())?;
        info!(boot = report.runs.len() + 1, "node starting");

        let outcome = node.run(shutdown.clone()).await?;
        report.runs.push(outcome.summary);

        match outcome.exit {
            NodeExit::Restart(reason) => {
                report.restarts += 1;
                warn!(%reason, restarts = report.restarts, "rebuilding node");
                if *shutdown.borrow() {
                    break;
                }
            }
            NodeExit::Shutdown => break,
        }
    }

    Ok(report)
}
