use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use vibemon::bus::RegisterData;
use vibemon::node::supervise;
use vibemon::sensor::DEFAULT_SCALE_G;
use vibemon::sim::{
    simulated_driver, BrokerControl, BusControl, FaultInjector, InMemoryBroker, SimulatedDriver, SimulatedWifi,
    Waveform,
};
use vibemon::*;

const STILL: Waveform = Waveform::Constant { x: 0.0, y: 0.0, z: 1.0 };

fn fast_timing() -> BusTiming {
    BusTiming::for_baud(115_200, Duration::from_millis(2), Duration::ZERO)
}

fn two_sensor_task(window: u32) -> (AcquisitionTask<SimulatedDriver>, mpsc::Receiver<AggregatedBatch>, BusControl) {
    let devices = [DeviceAddress::new(1), DeviceAddress::new(2)];
    let (driver, control) = simulated_driver(&[(devices[0], STILL), (devices[1], STILL)], FaultInjector::disabled(), fast_timing());
    let (tx, rx) = mpsc::channel(16);
    let task = AcquisitionTask::new(
        SensorReader::new(driver, &devices),
        window,
        5,
        tx,
        Arc::new(LinkHealth::new()),
    );
    (task, rx, control)
}

#[test]
fn test_fault_on_one_sensor_is_isolated() {
    let (mut task, mut rx, control) = two_sensor_task(4);

    task.run_cycle(0);
    task.run_cycle(10);

    control.set_offline(2, true);
    for t in [20, 30, 40] {
        let report = task.run_cycle(t);
        assert_eq!(report.faults, 1);
        assert_eq!(report.samples, 1);
    }

    // Sensor 0 kept its cadence and closed a window on schedule.
    let first = rx.try_recv().unwrap();
    assert_eq!(first.sensor, 0);
    assert_eq!(first.sample_count, 4);
    assert_eq!((first.window_start_time, first.window_end_time), (0, 30));

    // Sensor 1's open window is untouched by the faults.
    assert_eq!(task.aggregator(1).unwrap().open_count(), 2);

    control.set_offline(2, false);
    task.run_cycle(50);
    task.run_cycle(60);

    let second = rx.try_recv().unwrap();
    assert_eq!(second.sensor, 1);
    assert_eq!(second.sample_count, 4);
    assert!(!second.partial);
    assert_eq!((second.window_start_time, second.window_end_time), (0, 60));
    assert_eq!(task.stats().sensor_faults, 3);
}

#[test]
fn test_prolonged_fault_flushes_partial_window() {
    let (mut task, mut rx, control) = two_sensor_task(24);
    task.run_cycle(0);
    task.run_cycle(10);

    control.set_offline(1, true);
    for i in 0..8u64 {
        task.run_cycle(20 + i * 10);
    }

    let batch = rx.try_recv().unwrap();
    assert_eq!(batch.sensor, 0);
    assert!(batch.partial);
    assert_eq!(batch.sample_count, 2);
    assert_eq!(task.stats().fault_flushes, 1);
    assert!(rx.try_recv().is_err(), "flushed only once per fault run");
    assert_eq!(task.aggregator(1).unwrap().open_count(), 10);
}

#[tokio::test]
async fn test_window_of_readings_becomes_one_payload() {
    let wave = Waveform::Vibration {
        amplitude_g: 0.3,
        frequency_hz: 20.0,
        sample_period_ms: 10,
    };
    let device = DeviceAddress::new(7);
    let (driver, _) = simulated_driver(&[(device, wave)], FaultInjector::disabled(), fast_timing());
    let (tx, mut rx) = mpsc::channel(4);
    let health = Arc::new(LinkHealth::new());
    let mut task = AcquisitionTask::new(SensorReader::new(driver, &[device]), 24, 5, tx, health.clone());

    for i in 0..24u64 {
        task.run_cycle(i * 10);
    }
    let batch = rx.try_recv().unwrap();

    let quantize = |v: f32| f32::from((v / DEFAULT_SCALE_G).round() as i16) * DEFAULT_SCALE_G;
    let expected: f64 = (0..24u64)
        .map(|i| {
            let [x, y, z] = wave.at(i).map(quantize);
            f64::from((x * x + y * y + z * z).sqrt())
        })
        .sum::<f64>()
        / 24.0;

    let (broker, control) = InMemoryBroker::new();
    let topics = Topics {
        telemetry: "t".into(),
        status: "s".into(),
    };
    let mut publisher = TelemetryPublisher::new(
        broker,
        "node",
        topics,
        ReconnectPolicy::default(),
        4,
        TimeBase::new(0),
        health.clone(),
    );
    health.set_wifi_connected(true);
    publisher.service_session(240).await;
    assert_eq!(publisher.submit(batch, 240).await, 1);

    let payload: TelemetryPayload = serde_json::from_str(&control.payloads_on("t")[0]).unwrap();
    assert_eq!(payload.samples, 24);
    assert!(!payload.partial);
    assert!((f64::from(payload.acceleration) - expected).abs() < 1e-5);
    assert_eq!(payload.timestamp, 230);
}

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.acquisition.window_size = 4;
    config.acquisition.sample_period_ms = 5;
    config.network.service_period_ms = 10;
    config.health.period_ms = 50;
    config.watchdog.deadline_ms = 100;
    config.bus.response_timeout_ms = 2;
    config.bus.turnaround_us = 0;
    config
}

fn sim_hardware(config: &NodeConfig) -> (Hardware<SimulatedDriver, SimulatedWifi, InMemoryBroker>, BusControl, BrokerControl) {
    let devices: Vec<_> = config.sensors.iter().map(|&d| (d, STILL)).collect();
    let (bus, bus_control) = simulated_driver(&devices, FaultInjector::disabled(), config.bus_timing());
    let (wifi, _) = SimulatedWifi::new();
    let (broker, broker_control) = InMemoryBroker::new();
    (Hardware { bus, wifi, broker }, bus_control, broker_control)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_publishes_until_shutdown() {
    let config = test_config();
    let (hardware, _, broker) = sim_hardware(&config);
    let node = Node::new(config, hardware, TimeBase::new(1_000_000)).unwrap();
    let health = node.health();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(node.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(health.wifi_connected());
    assert!(health.broker_connected());
    shutdown_tx.send(true).unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.exit, NodeExit::Shutdown);
    assert!(outcome.summary.acquisition.samples > 0);
    assert_eq!(outcome.summary.acquisition.sensor_faults, 0);

    let telemetry = broker.payloads_on("vibemon/telemetry");
    assert!(!telemetry.is_empty());
    let first: TelemetryPayload = serde_json::from_str(&telemetry[0]).unwrap();
    assert!((first.acceleration - 1.0).abs() < 1e-4);

    let status = broker.payloads_on("vibemon/status");
    assert!(!status.is_empty());
    let report: StatusReport = serde_json::from_str(&status[0]).unwrap();
    assert_eq!(report.status, HealthStatus::Healthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistent_sensor_faults_restart_node() {
    let mut config = test_config();
    config.health.critical_restart_after = 2;
    let (hardware, bus, _) = sim_hardware(&config);
    bus.set_offline(1, true);
    bus.set_offline(2, true);

    let node = Node::new(config, hardware, TimeBase::new(0)).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = tokio::time::timeout(Duration::from_secs(5), node.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.exit, NodeExit::Restart(RestartReason::HealthCritical));
    assert!(outcome.summary.monitor.critical_evaluations >= 2);
    assert_eq!(outcome.summary.acquisition.samples, 0);
}

/// Answers correctly but far slower than the watchdog allows.
struct StallingBus;

impl FieldBus for StallingBus {
    fn transact(&mut self, _address: u8, _range: bus::RegisterRange) -> Result<RegisterData, BusFault> {
        std::thread::sleep(Duration::from_millis(80));
        Err(BusFault::Timeout { address: 0, timeout_ms: 80 })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_acquisition_trips_watchdog() {
    let config = test_config();
    let (wifi, _) = SimulatedWifi::new();
    let (broker, _) = InMemoryBroker::new();
    let hardware = Hardware {
        bus: StallingBus,
        wifi,
        broker,
    };

    let node = Node::new(config, hardware, TimeBase::new(0)).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = tokio::time::timeout(Duration::from_secs(5), node.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        outcome.exit,
        NodeExit::Restart(RestartReason::AcquisitionStalled { silent_ms }) if silent_ms > 100
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supervisor_rebuilds_after_restart() {
    let mut config = test_config();
    config.health.critical_restart_after = 1;

    let mut boots = 0;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = shutdown_tx.send(true);
    });

    let report = supervise(
        config,
        |config| {
            boots += 1;
            let (hardware, bus, _) = sim_hardware(config);
            if boots == 1 {
                bus.set_offline(1, true);
                bus.set_offline(2, true);
            }
            Ok(hardware)
        },
        shutdown_rx,
    )
    .await
    .unwrap();
    stopper.await.unwrap();

    assert_eq!(report.restarts, 1);
    assert_eq!(report.runs.len(), 2);
    assert_eq!(report.runs[0].acquisition.samples, 0);
    assert!(report.runs[1].acquisition.samples > 0);
}
