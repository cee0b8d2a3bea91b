//! Simulated hardware: field-bus devices, fault injection, a radio and a
//! broker. Used by the integration tests and by `vibemon --simulate`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::bus::{
    crc16, BusDriver, BusTiming, Direction, DirectionPin, SerialPort, StdDelay, EXCEPTION_FLAG,
    FUNCTION_READ_HOLDING, MAX_REGISTERS, REQUEST_FRAME_SIZE,
};
use crate::config::NetworkCredentials;
use crate::error::{LinkFault, PublishFault};
use crate::link::NetworkInterface;
use crate::publisher::BrokerSession;
use crate::sensor::{DeviceAddress, AXIS_REGISTER_COUNT};

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Fault injection

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Chance per transaction that the device stays silent.
    pub timeout_rate_percent: f32,
    /// Chance per transaction that the response checksum is damaged.
    pub corrupt_rate_percent: f32,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_rate_percent: 0.5,
            corrupt_rate_percent: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Timeout,
    CorruptChecksum,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub decisions: u32,
    pub timeouts_injected: u32,
    pub corruptions_injected: u32,
}

/// Probabilistic bus fault source with a fixed-seed LCG so runs repeat.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self::with_seed(config, 0x1234_5678_9ABC_DEF0)
    }

    pub fn with_seed(config: FaultInjectionConfig, seed: u64) -> Self {
        Self {
            config,
            stats: FaultInjectionStats::default(),
            rng_state: seed,
        }
    }

    pub fn disabled() -> Self {
        Self::new(FaultInjectionConfig::default())
    }

    /// Decides the fate of one transaction.
    pub fn next_fault(&mut self) -> Option<InjectedFault> {
        if !self.config.enabled {
            return None;
        }
        self.stats.decisions += 1;

        let roll = self.random_percent();
        if roll < self.config.timeout_rate_percent {
            self.stats.timeouts_injected += 1;
            Some(InjectedFault::Timeout)
        } else if roll < self.config.timeout_rate_percent + self.config.corrupt_rate_percent {
            self.stats.corruptions_injected += 1;
            Some(InjectedFault::CorruptChecksum)
        } else {
            None
        }
    }

    pub fn stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn config(&self) -> &FaultInjectionConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.rng_state
    }

    /// Uniform in `[0, 100)`.
    fn random_percent(&mut self) -> f32 {
        ((self.next_random() >> 40) % 10_000) as f32 / 100.0
    }
}

// ---------------------------------------------------------------------------
// Field bus

/// What a simulated accelerometer reports, in g.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Waveform {
    Constant { x: f32, y: f32, z: f32 },
    /// Gravity on z plus a sinusoid of the given amplitude on every axis.
    Vibration {
        amplitude_g: f32,
        frequency_hz: f32,
        sample_period_ms: u64,
    },
}

impl Waveform {
    pub fn at(&self, index: u64) -> [f32; 3] {
        match *self {
            Waveform::Constant { x, y, z } => [x, y, z],
            Waveform::Vibration {
                amplitude_g,
                frequency_hz,
                sample_period_ms,
            } => {
                let t = (index * sample_period_ms) as f32 / 1000.0;
                let phase = 2.0 * std::f32::consts::PI * frequency_hz * t;
                [
                    amplitude_g * phase.sin(),
                    0.5 * amplitude_g * phase.cos(),
                    1.0 + 0.25 * amplitude_g * (2.0 * phase).sin(),
                ]
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SimDevice {
    address: DeviceAddress,
    waveform: Waveform,
    reads: u64,
}

impl SimDevice {
    fn registers(&mut self, start: u16, count: u16) -> Option<heapless::Vec<u8, 256>> {
        let base = self.address.first_register;
        let end = base.checked_add(self.address.register_count)?;
        if start < base || start.checked_add(count)? > end {
            return None;
        }

        let axes = self.waveform.at(self.reads);
        self.reads += 1;

        let mut out = heapless::Vec::new();
        for register in start..start + count {
            let offset = usize::from(register - base);
            let raw = if offset < usize::from(AXIS_REGISTER_COUNT) {
                let counts = (axes[offset] / self.address.scale).round();
                counts.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
            } else {
                0
            };
            out.extend_from_slice(&raw.to_be_bytes()).ok()?;
        }
        Some(out)
    }
}

#[derive(Debug, Default)]
struct BusControlState {
    offline: Vec<u8>,
    corrupt_next: u32,
    requests_seen: u32,
    bytes_lost: u32,
    responses_sent: u32,
}

/// Handle for steering a [`SimulatedBus`] after it has been moved into a driver.
#[derive(Debug, Clone, Default)]
pub struct BusControl {
    state: Arc<Mutex<BusControlState>>,
    transmit: Arc<AtomicBool>,
    direction_switches: Arc<AtomicU32>,
}

impl BusControl {
    /// An offline device never answers.
    pub fn set_offline(&self, bus_id: u8, offline: bool) {
        let mut state = lock(&self.state);
        state.offline.retain(|id| *id != bus_id);
        if offline {
            state.offline.push(bus_id);
        }
    }

    /// Damages the checksum of the next `n` responses.
    pub fn corrupt_next(&self, n: u32) {
        lock(&self.state).corrupt_next = n;
    }

    pub fn requests_seen(&self) -> u32 {
        lock(&self.state).requests_seen
    }

    /// Bytes written while the transceiver was not driving the line.
    pub fn bytes_lost(&self) -> u32 {
        lock(&self.state).bytes_lost
    }

    pub fn responses_sent(&self) -> u32 {
        lock(&self.state).responses_sent
    }

    pub fn direction_switches(&self) -> u32 {
        self.direction_switches.load(Ordering::Acquire)
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmit.load(Ordering::Acquire)
    }
}

/// Transceiver enable line wired to a [`SimulatedBus`].
#[derive(Debug)]
pub struct SimulatedDirectionPin {
    transmit: Arc<AtomicBool>,
    switches: Arc<AtomicU32>,
}

impl DirectionPin for SimulatedDirectionPin {
    fn set_direction(&mut self, direction: Direction) {
        let transmit = direction == Direction::Transmit;
        if self.transmit.swap(transmit, Ordering::AcqRel) != transmit {
            self.switches.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Serial port with devices on the far side. A request is answered when the
/// port is flushed, and only bytes written while transmitting reach the bus.
#[derive(Debug)]
pub struct SimulatedBus {
    devices: Vec<SimDevice>,
    tx: heapless::Vec<u8, REQUEST_FRAME_SIZE>,
    tx_overrun: bool,
    rx: VecDeque<u8>,
    injector: FaultInjector,
    control: BusControl,
}

impl SimulatedBus {
    pub fn new(devices: &[(DeviceAddress, Waveform)], injector: FaultInjector) -> (Self, SimulatedDirectionPin, BusControl) {
        let control = BusControl::default();
        let pin = SimulatedDirectionPin {
            transmit: control.transmit.clone(),
            switches: control.direction_switches.clone(),
        };
        let bus = Self {
            devices: devices
                .iter()
                .map(|&(address, waveform)| SimDevice {
                    address,
                    waveform,
                    reads: 0,
                })
                .collect(),
            tx: heapless::Vec::new(),
            tx_overrun: false,
            rx: VecDeque::new(),
            injector,
            control: control.clone(),
        };
        (bus, pin, control)
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    /// Leaves `bytes` in the receive buffer as if a late response arrived.
    pub fn inject_noise(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    fn answer(&mut self) {
        let request = core::mem::take(&mut self.tx);
        let overrun = core::mem::replace(&mut self.tx_overrun, false);
        if overrun || request.len() != REQUEST_FRAME_SIZE {
            return;
        }

        let crc = u16::from_le_bytes([request[6], request[7]]);
        if crc16(&request[..6]) != crc || request[1] != FUNCTION_READ_HOLDING {
            return;
        }

        let address = request[0];
        let start = u16::from_be_bytes([request[2], request[3]]);
        let count = u16::from_be_bytes([request[4], request[5]]);

        let corrupt = {
            let mut state = lock(&self.control.state);
            state.requests_seen += 1;
            if state.offline.contains(&address) {
                return;
            }
            if state.corrupt_next > 0 {
                state.corrupt_next -= 1;
                true
            } else {
                false
            }
        };

        let Some(device) = self.devices.iter_mut().find(|d| d.address.bus_id == address) else {
            return;
        };

        let corrupt = match self.injector.next_fault() {
            Some(InjectedFault::Timeout) => return,
            Some(InjectedFault::CorruptChecksum) => true,
            None => corrupt,
        };

        let mut frame: Vec<u8> = Vec::with_capacity(5 + 2 * usize::from(count));
        match (count <= MAX_REGISTERS).then(|| device.registers(start, count)).flatten() {
            Some(data) => {
                frame.extend_from_slice(&[address, FUNCTION_READ_HOLDING, data.len() as u8]);
                frame.extend_from_slice(&data);
            }
            None => {
                frame.extend_from_slice(&[address, FUNCTION_READ_HOLDING | EXCEPTION_FLAG, ILLEGAL_DATA_ADDRESS]);
            }
        }
        let mut crc = crc16(&frame).to_le_bytes();
        if corrupt {
            crc[0] ^= 0x5A;
        }
        frame.extend_from_slice(&crc);

        trace!(address, len = frame.len(), corrupt, "simulated response");
        lock(&self.control.state).responses_sent += 1;
        self.rx.extend(frame);
    }
}

impl SerialPort for SimulatedBus {
    type Error = Infallible;

    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error> {
        if !self.control.is_transmitting() {
            lock(&self.control.state).bytes_lost += 1;
            return Ok(());
        }
        if self.tx.push(byte).is_err() {
            self.tx_overrun = true;
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.answer();
        Ok(())
    }

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

pub type SimulatedDriver = BusDriver<SimulatedBus, SimulatedDirectionPin, StdDelay>;

/// A driver over simulated devices, plus the handle that steers them.
pub fn simulated_driver(
    devices: &[(DeviceAddress, Waveform)],
    injector: FaultInjector,
    timing: BusTiming,
) -> (SimulatedDriver, BusControl) {
    let (bus, pin, control) = SimulatedBus::new(devices, injector);
    (BusDriver::new(bus, pin, StdDelay, timing), control)
}

// ---------------------------------------------------------------------------
// Wireless link

#[derive(Debug)]
struct WifiState {
    in_range: bool,
    associated: bool,
    fail_next: u32,
    attempts: u32,
    expected_ssid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WifiControl {
    state: Arc<Mutex<WifiState>>,
}

impl WifiControl {
    /// Leaving range drops any current association.
    pub fn set_in_range(&self, in_range: bool) {
        let mut state = lock(&self.state);
        state.in_range = in_range;
        if !in_range {
            state.associated = false;
        }
    }

    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    pub fn drop_association(&self) {
        lock(&self.state).associated = false;
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn is_associated(&self) -> bool {
        lock(&self.state).associated
    }
}

#[derive(Debug)]
pub struct SimulatedWifi {
    state: Arc<Mutex<WifiState>>,
}

impl SimulatedWifi {
    pub fn new() -> (Self, WifiControl) {
        Self::build(None)
    }

    /// Only accepts the given network name.
    pub fn for_ssid(ssid: impl Into<String>) -> (Self, WifiControl) {
        Self::build(Some(ssid.into()))
    }

    fn build(expected_ssid: Option<String>) -> (Self, WifiControl) {
        let state = Arc::new(Mutex::new(WifiState {
            in_range: true,
            associated: false,
            fail_next: 0,
            attempts: 0,
            expected_ssid,
        }));
        (
            Self { state: state.clone() },
            WifiControl { state },
        )
    }
}

impl NetworkInterface for SimulatedWifi {
    async fn associate(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkFault> {
        let mut state = lock(&self.state);
        state.attempts += 1;

        if !state.in_range {
            return Err(LinkFault::NotFound);
        }
        if state.expected_ssid.as_deref().is_some_and(|ssid| ssid != credentials.ssid) {
            return Err(LinkFault::NotFound);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LinkFault::Rejected);
        }
        state.associated = true;
        Ok(())
    }

    fn is_associated(&self) -> bool {
        lock(&self.state).associated
    }

    fn disassociate(&mut self) {
        lock(&self.state).associated = false;
    }
}

// ---------------------------------------------------------------------------
// Broker

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    connected: bool,
    reject_next: u32,
    connects: u32,
    client_id: Option<String>,
    messages: Vec<PublishedMessage>,
}

#[derive(Debug, Clone)]
pub struct BrokerControl {
    state: Arc<Mutex<BrokerState>>,
}

impl BrokerControl {
    /// An unavailable broker refuses connections and resets live sessions.
    pub fn set_available(&self, available: bool) {
        let mut state = lock(&self.state);
        state.available = available;
        if !available {
            state.connected = false;
        }
    }

    pub fn reject_next(&self, n: u32) {
        lock(&self.state).reject_next = n;
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.state).client_id.clone()
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        lock(&self.state).messages.clone()
    }

    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        lock(&self.state)
            .messages
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

/// Broker that records every accepted message in memory.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> (Self, BrokerControl) {
        let state = Arc::new(Mutex::new(BrokerState {
            available: true,
            connected: false,
            reject_next: 0,
            connects: 0,
            client_id: None,
            messages: Vec::new(),
        }));
        (Self { state: state.clone() }, BrokerControl { state })
    }
}

impl BrokerSession for InMemoryBroker {
    async fn connect(&mut self, client_id: &str) -> Result<(), PublishFault> {
        let mut state = lock(&self.state);
        if !state.available {
            return Err(PublishFault::Transport("connection refused".into()));
        }
        state.connected = true;
        state.connects += 1;
        state.client_id = Some(client_id.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishFault> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(PublishFault::Transport("connection reset".into()));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(PublishFault::Rejected("not authorized".into()));
        }
        state.messages.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn disconnect(&mut self) {
        lock(&self.state).connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injector_is_deterministic() {
        let config = FaultInjectionConfig {
            enabled: true,
            timeout_rate_percent: 20.0,
            corrupt_rate_percent: 20.0,
        };
        let mut a = FaultInjector::new(config);
        let mut b = FaultInjector::new(config);
        let run_a: Vec<_> = (0..200).map(|_| a.next_fault()).collect();
        let run_b: Vec<_> = (0..200).map(|_| b.next_fault()).collect();
        assert_eq!(run_a, run_b);

        let injected = a.stats().timeouts_injected + a.stats().corruptions_injected;
        assert!(injected > 20 && injected < 140, "injected {}", injected);
    }

    #[test]
    fn test_disabled_injector_never_fires() {
        let mut injector = FaultInjector::disabled();
        assert!((0..100).all(|_| injector.next_fault().is_none()));
        assert_eq!(injector.stats().decisions, 0);
    }

    #[test]
    fn test_vibration_waveform_centres_on_gravity() {
        let wave = Waveform::Vibration {
            amplitude_g: 0.2,
            frequency_hz: 25.0,
            sample_period_ms: 10,
        };
        let [x, y, z] = wave.at(0);
        assert!(x.abs() < 1e-6);
        assert!((y - 0.1).abs() < 1e-6);
        assert!((z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bytes_written_while_receiving_are_lost() {
        let (mut bus, _pin, control) = SimulatedBus::new(
            &[(DeviceAddress::new(1), Waveform::Constant { x: 0.0, y: 0.0, z: 1.0 })],
            FaultInjector::disabled(),
        );
        for byte in crate::bus::encode_request(1, DeviceAddress::new(1).register_range()) {
            let _ = bus.write(byte);
        }
        let _ = bus.flush();
        assert_eq!(control.bytes_lost(), 8);
        assert_eq!(control.responses_sent(), 0);
        assert!(bus.read().is_err());
    }
}
