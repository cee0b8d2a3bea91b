//! Broker session ownership, payload encoding and the outbound batch queue.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::AggregatedBatch;
use crate::clock::TimeBase;
use crate::error::PublishFault;
use crate::health::{LinkHealth, StatusReport};
use crate::reconnect::{ConnectionState, ReconnectMachine, ReconnectPolicy};
use crate::sensor::SensorIndex;

pub const MAX_PAYLOAD_SIZE: usize = 256;

pub type PayloadBuffer = ArrayString<MAX_PAYLOAD_SIZE>;

/// Broker client seam. Implementations own their transport and report a
/// dead transport through `is_connected`.
pub trait BrokerSession: Send {
    fn connect(&mut self, client_id: &str) -> impl Future<Output = Result<(), PublishFault>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), PublishFault>> + Send;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub telemetry: String,
    pub status: String,
}

/// Wire form of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub acceleration: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub samples: u32,
    pub timestamp: u64,
    pub sensor: SensorIndex,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl TelemetryPayload {
    pub fn from_batch(batch: &AggregatedBatch, timestamp: u64) -> Self {
        Self {
            acceleration: batch.mean_magnitude,
            x: batch.mean_x,
            y: batch.mean_y,
            z: batch.mean_z,
            samples: batch.sample_count,
            timestamp,
            sensor: batch.sensor,
            partial: batch.partial,
        }
    }
}

/// Serializes payloads into a fixed buffer so an oversized message is
/// refused instead of allocated.
#[derive(Debug, Default)]
pub struct PayloadEncoder {
    buffer: PayloadBuffer,
}

impl PayloadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode<T: Serialize>(&mut self, value: &T) -> Result<&str, PublishFault> {
        self.buffer.clear();

        let json = serde_json::to_string(value).map_err(|_| PublishFault::Encode("serialization failed"))?;
        self.buffer
            .try_push_str(&json)
            .map_err(|_| PublishFault::Encode("payload exceeds buffer"))?;

        Ok(&self.buffer)
    }
}

/// Bounded FIFO of batches awaiting a session. Full means the oldest goes.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<AggregatedBatch>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "outbound queue needs room for one batch");
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Returns the batch evicted to make room, if any.
    pub fn push(&mut self, batch: AggregatedBatch) -> Option<AggregatedBatch> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(batch);

        debug_assert!(self.items.len() <= self.capacity);
        evicted
    }

    pub fn front(&self) -> Option<&AggregatedBatch> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<AggregatedBatch> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregatedBatch> {
        self.items.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub sequence: u32,
    pub published_at: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PublisherStats {
    pub telemetry_published: u32,
    pub status_published: u32,
    pub publish_failures: u32,
    pub no_session: u32,
    pub queue_evictions: u32,
    pub rejected_dropped: u32,
    pub session_losses: u32,
}

pub struct TelemetryPublisher<B> {
    session: B,
    machine: ReconnectMachine,
    client_id: String,
    topics: Topics,
    queue: OutboundQueue,
    encoder: PayloadEncoder,
    health: Arc<LinkHealth>,
    time_base: TimeBase,
    sequence: u32,
    stats: PublisherStats,
}

impl<B: BrokerSession> TelemetryPublisher<B> {
    pub fn new(
        session: B,
        client_id: impl Into<String>,
        topics: Topics,
        policy: ReconnectPolicy,
        queue_capacity: usize,
        time_base: TimeBase,
        health: Arc<LinkHealth>,
    ) -> Self {
        Self {
            session,
            machine: ReconnectMachine::new("broker", policy),
            client_id: client_id.into(),
            topics,
            queue: OutboundQueue::new(queue_capacity),
            encoder: PayloadEncoder::new(),
            health,
            time_base,
            sequence: 0,
            stats: PublisherStats::default(),
        }
    }

    pub fn has_session(&self) -> bool {
        self.machine.is_connected() && self.session.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn machine(&self) -> &ReconnectMachine {
        &self.machine
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    pub fn session(&self) -> &B {
        &self.session
    }

    /// Publishes one batch now. Fails fast with `NoSession` when the broker
    /// is unreachable; never retries inline.
    pub async fn publish(&mut self, batch: &AggregatedBatch, now: u64) -> Result<Ack, PublishFault> {
        if !self.has_session() {
            self.stats.no_session += 1;
            return Err(PublishFault::NoSession);
        }

        let payload = TelemetryPayload::from_batch(batch, self.time_base.to_epoch(batch.window_end_time));
        let text = self.encoder.encode(&payload)?;
        let result = self.session.publish(&self.topics.telemetry, text).await;

        match result {
            Ok(()) => {
                self.sequence = self.sequence.wrapping_add(1);
                self.stats.telemetry_published += 1;
                self.health.record_publish_success(now);
                debug!(
                    sensor = batch.sensor,
                    samples = batch.sample_count,
                    sequence = self.sequence,
                    "telemetry published"
                );
                Ok(Ack {
                    sequence: self.sequence,
                    published_at: now,
                })
            }
            Err(fault) => {
                self.on_publish_fault(&fault, now);
                Err(fault)
            }
        }
    }

    pub async fn publish_status(&mut self, report: &StatusReport, now: u64) -> Result<(), PublishFault> {
        if !self.has_session() {
            self.stats.no_session += 1;
            return Err(PublishFault::NoSession);
        }

        let text = self.encoder.encode(report)?;
        let result = self.session.publish(&self.topics.status, text).await;

        match result {
            Ok(()) => {
                self.stats.status_published += 1;
                self.health.record_publish_success(now);
                Ok(())
            }
            Err(fault) => {
                self.on_publish_fault(&fault, now);
                Err(fault)
            }
        }
    }

    /// Queues a batch, evicting the oldest when full.
    pub fn enqueue(&mut self, batch: AggregatedBatch) {
        if let Some(evicted) = self.queue.push(batch) {
            self.stats.queue_evictions += 1;
            warn!(
                sensor = evicted.sensor,
                window_end = evicted.window_end_time,
                "outbound queue full, oldest batch dropped"
            );
        }
    }

    /// Queues a batch and drains as much of the queue as the session allows.
    pub async fn submit(&mut self, batch: AggregatedBatch, now: u64) -> usize {
        self.enqueue(batch);
        self.flush_queue(now).await
    }

    /// Sends queued batches in order. Stops at the first retryable fault so
    /// ordering is preserved; rejected batches are discarded.
    pub async fn flush_queue(&mut self, now: u64) -> usize {
        let mut sent = 0;
        while let Some(batch) = self.queue.front().copied() {
            match self.publish(&batch, now).await {
                Ok(_) => {
                    self.queue.pop_front();
                    sent += 1;
                }
                Err(fault) if fault.is_final() => {
                    warn!(%fault, sensor = batch.sensor, "batch discarded");
                    self.queue.pop_front();
                    self.stats.rejected_dropped += 1;
                }
                Err(_) => break,
            }
        }
        sent
    }

    /// One session servicing step. Reconnects only while the wireless link
    /// is up, using the same retry discipline as the link itself.
    pub async fn service_session(&mut self, now: u64) -> ConnectionState {
        let wifi_up = self.health.wifi_connected();

        if self.machine.is_connected() && (!self.session.is_connected() || !wifi_up) {
            self.drop_session(now);
        }

        if self.machine.is_connected() || !wifi_up || !self.machine.ready_to_attempt(now) {
            return self.machine.state();
        }

        self.machine.begin_attempt(now);
        match self.session.connect(&self.client_id).await {
            Ok(()) => {
                info!(client_id = %self.client_id, "broker session established");
                self.machine.on_success(now);
                self.health.set_broker_connected(true, now);
            }
            Err(fault) => {
                warn!(%fault, attempt = self.machine.attempts_in_window(), "broker connect failed");
                self.session.disconnect();
                self.machine.on_failure(now);
            }
        }

        self.machine.state()
    }

    fn on_publish_fault(&mut self, fault: &PublishFault, now: u64) {
        self.stats.publish_failures += 1;
        self.health.record_publish_failure();
        warn!(%fault, "publish failed");

        if matches!(fault, PublishFault::Transport(_)) {
            self.drop_session(now);
        }
    }

    fn drop_session(&mut self, now: u64) {
        if self.machine.is_connected() {
            self.stats.session_losses += 1;
        }
        self.session.disconnect();
        self.machine.on_lost(now);
        self.health.set_broker_connected(false, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(sensor: SensorIndex, end: u64) -> AggregatedBatch {
        AggregatedBatch {
            sensor,
            mean_x: 0.1,
            mean_y: -0.2,
            mean_z: 1.0,
            mean_magnitude: 1.05,
            sample_count: 24,
            window_start_time: end.saturating_sub(230),
            window_end_time: end,
            partial: false,
        }
    }

    #[test]
    fn test_queue_evicts_oldest() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.push(batch(0, 10)).is_none());
        assert!(queue.push(batch(1, 20)).is_none());

        let evicted = queue.push(batch(0, 30)).unwrap();
        assert_eq!(evicted.window_end_time, 10);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.front().unwrap().window_end_time, 20);
    }

    #[test]
    fn test_partial_flag_only_when_set() {
        let mut encoder = PayloadEncoder::new();
        let full = TelemetryPayload::from_batch(&batch(1, 500), 1_000);
        let text = encoder.encode(&full).unwrap().to_string();
        assert!(!text.contains("partial"));
        assert!(text.contains(r#""samples":24"#));
        assert!(text.contains(r#""sensor":1"#));

        let mut short = batch(0, 500);
        short.partial = true;
        short.sample_count = 7;
        let text = encoder.encode(&TelemetryPayload::from_batch(&short, 1_000)).unwrap();
        assert!(text.contains(r#""partial":true"#));
    }

    #[test]
    fn test_encoder_refuses_oversized_payload() {
        let mut encoder = PayloadEncoder::new();
        let huge = "x".repeat(MAX_PAYLOAD_SIZE);
        assert!(matches!(encoder.encode(&huge), Err(PublishFault::Encode(_))));
    }
}
