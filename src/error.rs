//! Fault taxonomy for the acquisition node.
//!
//! Every fault here is absorbed by the component that observes it and is
//! reflected in counters; only the health monitor escalates.

use thiserror::Error;

use crate::sensor::SensorIndex;

/// Failure of a single field-bus transaction. The driver never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("no response from device {address:#04x} within {timeout_ms} ms")]
    Timeout { address: u8, timeout_ms: u32 },
    #[error("checksum mismatch (computed {computed:#06x}, received {received:#06x})")]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("device raised exception code {0:#04x}")]
    Exception(u8),
    #[error("serial port error")]
    Port,
    #[error("register range does not fit a frame")]
    FrameTooLarge,
    #[error("no device configured at index {0}")]
    UnknownDevice(SensorIndex),
}

/// A bus fault with the sensor it happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sensor {sensor} read failed: {cause}")]
pub struct SensorFault {
    pub sensor: SensorIndex,
    #[source]
    pub cause: BusFault,
}

/// Wireless association failures. Only ever reflected in link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkFault {
    #[error("access point not found")]
    NotFound,
    #[error("association rejected")]
    Rejected,
    #[error("association timed out")]
    Timeout,
    #[error("association lost")]
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishFault {
    #[error("no broker session")]
    NoSession,
    #[error("broker rejected message: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("payload encoding failed: {0}")]
    Encode(&'static str),
}

impl PublishFault {
    /// Faults after which the message is gone for good rather than retained.
    pub fn is_final(&self) -> bool {
        matches!(self, PublishFault::Rejected(_) | PublishFault::Encode(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Task(String),
}
