//! Half-duplex field-bus driver.
//!
//! Frames follow the Modbus-RTU read-holding-registers layout:
//!
//! ```text
//! request : [addr, 0x03, reg_hi, reg_lo, count_hi, count_lo, crc_lo, crc_hi]
//! response: [addr, 0x03, byte_count, data.., crc_lo, crc_hi]
//! error   : [addr, 0x83, code, crc_lo, crc_hi]
//! ```
//!
//! The driver owns the serial port and the transceiver direction line, so a
//! transaction needs `&mut self` and at most one can be in flight.

use crc::{Crc, CRC_16_MODBUS};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::BusFault;

pub const FUNCTION_READ_HOLDING: u8 = 0x03;
pub const EXCEPTION_FLAG: u8 = 0x80;
pub const REQUEST_FRAME_SIZE: usize = 8;
pub const MAX_FRAME_SIZE: usize = 256;
pub const MAX_REGISTERS: u16 = 125;
const HEADER_SIZE: usize = 3;
const CRC_SIZE: usize = 2;
const EXCEPTION_FRAME_SIZE: usize = 5;

const_assert!(HEADER_SIZE + 2 * MAX_REGISTERS as usize + CRC_SIZE <= MAX_FRAME_SIZE);

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub type RequestFrame = [u8; REQUEST_FRAME_SIZE];
pub type ResponseFrame = Vec<u8, MAX_FRAME_SIZE>;
/// Register payload of a successful response, two bytes per register.
pub type RegisterData = Vec<u8, MAX_FRAME_SIZE>;

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    pub start: u16,
    pub count: u16,
}

impl RegisterRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn byte_len(&self) -> usize {
        self.count as usize * 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Driver-enable line of the RS-485 transceiver.
pub trait DirectionPin {
    fn set_direction(&mut self, direction: Direction);
}

/// Byte-level UART access in the `nb` style used by embedded HALs.
pub trait SerialPort {
    type Error: core::fmt::Debug;

    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error>;
    /// Completes once every written byte has left the shift register.
    fn flush(&mut self) -> nb::Result<(), Self::Error>;
    fn read(&mut self) -> nb::Result<u8, Self::Error>;
}

pub trait Delay {
    fn delay_us(&mut self, us: u32);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(u64::from(us)));
    }
}

/// Anything able to run a register read against an addressed device.
pub trait FieldBus {
    fn transact(&mut self, address: u8, range: RegisterRange) -> Result<RegisterData, BusFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    pub response_timeout: Duration,
    pub turnaround: Duration,
    /// Idle wait between polls of an empty receive buffer.
    pub poll_interval: Duration,
}

impl BusTiming {
    /// Derives the poll interval from the time one 11-bit character takes.
    pub fn for_baud(baud_rate: u32, response_timeout: Duration, turnaround: Duration) -> Self {
        let char_time_us = 11_000_000 / u64::from(baud_rate.max(1));
        Self {
            response_timeout,
            turnaround,
            poll_interval: Duration::from_micros(char_time_us.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub transactions: u32,
    pub completed: u32,
    pub timeouts: u32,
    pub checksum_errors: u32,
    pub other_faults: u32,
}

pub fn encode_request(address: u8, range: RegisterRange) -> RequestFrame {
    let [reg_hi, reg_lo] = range.start.to_be_bytes();
    let [count_hi, count_lo] = range.count.to_be_bytes();
    let mut frame = [address, FUNCTION_READ_HOLDING, reg_hi, reg_lo, count_hi, count_lo, 0, 0];
    let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

/// Validates a complete response frame and extracts its register bytes.
pub fn decode_response(frame: &[u8], address: u8, range: RegisterRange) -> Result<RegisterData, BusFault> {
    if frame.len() < EXCEPTION_FRAME_SIZE {
        return Err(BusFault::UnexpectedResponse("frame too short"));
    }

    let (body, tail) = frame.split_at(frame.len() - CRC_SIZE);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if computed != received {
        return Err(BusFault::ChecksumMismatch { computed, received });
    }

    if body[0] != address {
        return Err(BusFault::UnexpectedResponse("address mismatch"));
    }
    if body[1] == FUNCTION_READ_HOLDING | EXCEPTION_FLAG {
        return Err(BusFault::Exception(body[2]));
    }
    if body[1] != FUNCTION_READ_HOLDING {
        return Err(BusFault::UnexpectedResponse("function mismatch"));
    }

    let byte_count = body[2] as usize;
    if byte_count != range.byte_len() || body.len() != HEADER_SIZE + byte_count {
        return Err(BusFault::UnexpectedResponse("byte count mismatch"));
    }

    let mut data = RegisterData::new();
    data.extend_from_slice(&body[HEADER_SIZE..])
        .map_err(|()| BusFault::FrameTooLarge)?;
    Ok(data)
}

pub struct BusDriver<P, D, T = StdDelay> {
    port: P,
    direction: D,
    delay: T,
    timing: BusTiming,
    stats: BusStats,
}

impl<P, D, T> BusDriver<P, D, T>
where
    P: SerialPort,
    D: DirectionPin,
    T: Delay,
{
    pub fn new(port: P, mut direction: D, delay: T, timing: BusTiming) -> Self {
        direction.set_direction(Direction::Receive);
        Self {
            port,
            direction,
            delay,
            timing,
            stats: BusStats::default(),
        }
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    fn run_transaction(&mut self, address: u8, range: RegisterRange) -> Result<RegisterData, BusFault> {
        if range.count == 0 || range.count > MAX_REGISTERS {
            return Err(BusFault::FrameTooLarge);
        }

        let request = encode_request(address, range);
        self.discard_stale_input();
        self.send(&request)?;

        let deadline = Instant::now() + self.timing.response_timeout;
        let mut frame = ResponseFrame::new();
        self.receive_exact(&mut frame, HEADER_SIZE, deadline, address)?;

        let expected_len = if frame[1] & EXCEPTION_FLAG != 0 {
            EXCEPTION_FRAME_SIZE
        } else {
            HEADER_SIZE + frame[2] as usize + CRC_SIZE
        };
        if expected_len > MAX_FRAME_SIZE {
            return Err(BusFault::UnexpectedResponse("declared length exceeds frame"));
        }
        self.receive_exact(&mut frame, expected_len, deadline, address)?;

        decode_response(&frame, address, range)
    }

    fn send(&mut self, request: &RequestFrame) -> Result<(), BusFault> {
        self.direction.set_direction(Direction::Transmit);
        self.turnaround();

        let written = request
            .iter()
            .try_for_each(|&byte| nb::block!(self.port.write(byte)))
            .and_then(|()| nb::block!(self.port.flush()));

        self.turnaround();
        self.direction.set_direction(Direction::Receive);

        written.map_err(|e| {
            warn!(error = ?e, "serial write failed");
            BusFault::Port
        })
    }

    fn receive_exact(
        &mut self,
        frame: &mut ResponseFrame,
        len: usize,
        deadline: Instant,
        address: u8,
    ) -> Result<(), BusFault> {
        while frame.len() < len {
            match self.port.read() {
                Ok(byte) => {
                    frame.push(byte).map_err(|_| BusFault::FrameTooLarge)?;
                }
                Err(nb::Error::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(BusFault::Timeout {
                            address,
                            timeout_ms: self.timing.response_timeout.as_millis() as u32,
                        });
                    }
                    self.delay.delay_us(self.timing.poll_interval.as_micros() as u32);
                }
                Err(nb::Error::Other(e)) => {
                    warn!(error = ?e, "serial read failed");
                    return Err(BusFault::Port);
                }
            }
        }
        Ok(())
    }

    /// Drops leftovers of an earlier, late response.
    fn discard_stale_input(&mut self) {
        let mut dropped = 0u32;
        while self.port.read().is_ok() {
            dropped += 1;
            if dropped as usize > MAX_FRAME_SIZE {
                break;
            }
        }
        if dropped > 0 {
            debug!(dropped, "discarded stale bus input");
        }
    }

    fn turnaround(&mut self) {
        let us = self.timing.turnaround.as_micros() as u32;
        if us > 0 {
            self.delay.delay_us(us);
        }
    }
}

impl<P, D, T> FieldBus for BusDriver<P, D, T>
where
    P: SerialPort,
    D: DirectionPin,
    T: Delay,
{
    fn transact(&mut self, address: u8, range: RegisterRange) -> Result<RegisterData, BusFault> {
        self.stats.transactions = self.stats.transactions.wrapping_add(1);
        let result = self.run_transaction(address, range);

        match &result {
            Ok(_) => {
                self.stats.completed = self.stats.completed.wrapping_add(1);
                debug!(address, start = range.start, count = range.count, "bus transaction complete");
            }
            Err(fault) => {
                match fault {
                    BusFault::Timeout { .. } => self.stats.timeouts += 1,
                    BusFault::ChecksumMismatch { .. } => self.stats.checksum_errors += 1,
                    _ => self.stats.other_faults += 1,
                }
                warn!(address, %fault, "bus transaction failed");
            }
        }

        result
    }
}
