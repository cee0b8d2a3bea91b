//! # Vibration Acquisition Node
//!
//! Firmware core for a two-core vibration monitoring node: accelerometers on
//! a half-duplex field bus are polled at a fixed period, their samples are
//! reduced to fixed-size windows, and window summaries are published to a
//! message broker over a wireless link that comes and goes.
//!
//! ## Features
//!
//! - **Deterministic acquisition**: a dedicated core polls every sensor each period
//! - **Fault isolation**: a failed bus transaction only touches that sensor's counters
//! - **Bounded memory**: fixed frames, bounded hand-off channel and outbound queue
//! - **Self-healing links**: shared reconnect state machine for Wi-Fi and broker
//! - **Escalation**: health classification, forced re-association and watchdog restart
//!
//! ## Quick Start
//!
//! ```rust
//! use vibemon::{RawSample, SampleAggregator};
//!
//! let mut aggregator = SampleAggregator::new(0, 4);
//! let mut batch = None;
//! for (i, z) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
//!     batch = aggregator.push(RawSample::new(0, 0.0, 0.0, z, i as u64 * 10));
//! }
//!
//! let batch = batch.expect("fourth sample closes the window");
//! assert_eq!(batch.sample_count, 4);
//! assert!((batch.mean_magnitude - 2.5).abs() < 1e-6);
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Half-duplex register transactions with CRC framing
//! - [`sensor`] - Per-device reads and axis decoding
//! - [`aggregator`] - Fixed-window reduction of sample streams
//! - [`link`] - Wireless association and reconnection
//! - [`publisher`] - Broker session, payload encoding and outbound queue
//! - [`health`] - Shared link health and periodic classification
//! - [`scheduler`] - Task table, acquisition loop and network task bodies
//! - [`watchdog`] - Heartbeat deadline and restart requests
//! - [`node`] - Wiring of one boot and the restart supervisor
//! - [`sim`] - Simulated devices, radio and broker

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod aggregator;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod link;
pub mod node;
pub mod publisher;
pub mod reconnect;
pub mod scheduler;
pub mod sensor;
pub mod sim;
pub mod transport;
pub mod watchdog;

// Re-export main public types for convenience
pub use aggregator::{AggregatedBatch, SampleAggregator};
pub use bus::{BusDriver, BusTiming, FieldBus, RegisterRange};
pub use clock::{MonotonicClock, TimeBase};
pub use config::{NetworkCredentials, NodeConfig};
pub use error::{BusFault, ConfigError, LinkFault, NodeError, PublishFault, SensorFault};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus, LinkHealth, StatusReport};
pub use link::{NetworkInterface, NetworkLinkManager};
pub use node::{supervise, Hardware, Node, NodeExit, RunOutcome};
pub use publisher::{BrokerSession, OutboundQueue, TelemetryPayload, TelemetryPublisher, Topics};
pub use reconnect::{ConnectionState, ReconnectMachine, ReconnectPolicy};
pub use scheduler::{AcquisitionTask, TaskSpec, TaskTable};
pub use sensor::{DeviceAddress, RawSample, SensorReader};
pub use transport::TcpBroker;
pub use watchdog::{RestartReason, Watchdog};
