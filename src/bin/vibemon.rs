use clap::{App, Arg};
use colored::*;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vibemon::node::{supervise, Hardware, SupervisorReport};
use vibemon::sensor::DeviceAddress;
use vibemon::sim::{simulated_driver, FaultInjectionConfig, FaultInjector, InMemoryBroker, SimulatedWifi, Waveform};
use vibemon::{NodeConfig, NodeError, TcpBroker};

fn waveforms(config: &NodeConfig) -> Vec<(DeviceAddress, Waveform)> {
    config
        .sensors
        .iter()
        .enumerate()
        .map(|(i, &address)| {
            let waveform = Waveform::Vibration {
                amplitude_g: 0.05 * (i as f32 + 1.0),
                frequency_hz: 25.0 + 10.0 * i as f32,
                sample_period_ms: config.acquisition.sample_period_ms,
            };
            (address, waveform)
        })
        .collect()
}

fn init_logging(verbosity: u64) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn print_report(report: &SupervisorReport) {
    println!();
    println!("{}", "Run summary".bright_blue().bold());
    println!("{} {}", "Boots:".bright_white(), report.runs.len());
    let restarts = if report.restarts == 0 {
        report.restarts.to_string().bright_green()
    } else {
        report.restarts.to_string().bright_yellow()
    };
    println!("{} {}", "Restarts:".bright_white(), restarts);

    for (boot, run) in report.runs.iter().enumerate() {
        println!(
            "  {} uptime {} ms, {} samples, {} sensor faults, {} batches sent, {} dropped",
            format!("#{}", boot + 1).bright_cyan(),
            run.uptime_ms,
            run.acquisition.samples,
            run.acquisition.sensor_faults,
            run.acquisition.batches_sent,
            run.acquisition.batches_dropped,
        );
        println!(
            "     {} telemetry, {} status, {} publish failures, {} evicted, {} critical evaluations",
            run.publisher.telemetry_published,
            run.publisher.status_published,
            run.publisher.publish_failures,
            run.publisher.queue_evictions,
            run.monitor.critical_evaluations,
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vibemon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Vibration acquisition node")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file (defaults apply when omitted)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .short("s")
                .long("simulate")
                .help("Publish to an in-memory broker and inject bus faults"),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("duration must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .get_matches();

    init_logging(matches.occurrences_of("verbose"));

    let config = match matches.value_of("config") {
        Some(path) => NodeConfig::load(path).map_err(NodeError::from)?,
        None => NodeConfig::default(),
    };
    let simulate = matches.is_present("simulate");
    let duration = matches
        .value_of("duration")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    println!("{}", "vibemon - vibration acquisition node".bright_blue().bold());
    println!(
        "{} {} sensors, window {}, period {} ms",
        "Acquisition:".bright_white(),
        config.sensors.len(),
        config.acquisition.window_size,
        config.acquisition.sample_period_ms
    );
    if simulate {
        println!("{} {}", "Broker:".bright_white(), "in-memory (simulation)".yellow());
    } else {
        println!(
            "{} {}:{}",
            "Broker:".bright_white(),
            config.broker.host,
            config.broker.port
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match duration {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => info!(seconds = limit.as_secs(), "run time elapsed"),
                    _ = tokio::signal::ctrl_c() => info!("interrupted"),
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                info!("interrupted");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let faults = FaultInjectionConfig {
        enabled: simulate,
        ..FaultInjectionConfig::default()
    };

    let result = if simulate {
        supervise(
            config,
            |config| {
                let (bus, _) = simulated_driver(&waveforms(config), FaultInjector::new(faults), config.bus_timing());
                let (wifi, _) = SimulatedWifi::new();
                let (broker, _) = InMemoryBroker::new();
                Ok(Hardware { bus, wifi, broker })
            },
            shutdown_rx,
        )
        .await
    } else {
        supervise(
            config,
            |config| {
                let (bus, _) = simulated_driver(&waveforms(config), FaultInjector::new(faults), config.bus_timing());
                let (wifi, _) = SimulatedWifi::new();
                Ok(Hardware {
                    bus,
                    wifi,
                    broker: TcpBroker::new(&config.broker),
                })
            },
            shutdown_rx,
        )
        .await
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "node failed");
            println!("{} {}", "Error:".bright_red(), e);
            Err(e.into())
        }
    }
}
