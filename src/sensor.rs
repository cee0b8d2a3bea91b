//! Accelerometer polling over the field bus.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bus::{FieldBus, RegisterRange};
use crate::error::{BusFault, SensorFault};

/// Position of a sensor in the configured device list.
pub type SensorIndex = usize;

pub const MAX_SENSORS: usize = 4;
pub const AXIS_REGISTER_COUNT: u16 = 3;
/// ±2 g full scale over a signed 16-bit register.
pub const DEFAULT_SCALE_G: f32 = 1.0 / 16384.0;

/// Static bus identity and register map of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub bus_id: u8,
    pub first_register: u16,
    #[serde(default = "default_register_count")]
    pub register_count: u16,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_register_count() -> u16 {
    AXIS_REGISTER_COUNT
}

fn default_scale() -> f32 {
    DEFAULT_SCALE_G
}

impl DeviceAddress {
    pub fn new(bus_id: u8) -> Self {
        Self {
            bus_id,
            first_register: 0x0000,
            register_count: AXIS_REGISTER_COUNT,
            scale: DEFAULT_SCALE_G,
        }
    }

    pub fn register_range(&self) -> RegisterRange {
        RegisterRange::new(self.first_register, self.register_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub sensor: SensorIndex,
    pub axis_x: f32,
    pub axis_y: f32,
    pub axis_z: f32,
    pub magnitude: f32,
    /// Milliseconds since boot.
    pub capture_time: u64,
}

impl RawSample {
    pub fn new(sensor: SensorIndex, axis_x: f32, axis_y: f32, axis_z: f32, capture_time: u64) -> Self {
        Self {
            sensor,
            axis_x,
            axis_y,
            axis_z,
            magnitude: magnitude(axis_x, axis_y, axis_z),
            capture_time,
        }
    }
}

pub fn magnitude(x: f32, y: f32, z: f32) -> f32 {
    (x * x + y * y + z * z).sqrt()
}

/// Scales the first three big-endian two's-complement registers.
pub fn decode_axes(data: &[u8], scale: f32) -> Result<[f32; 3], BusFault> {
    if data.len() < AXIS_REGISTER_COUNT as usize * 2 {
        return Err(BusFault::UnexpectedResponse("short axis payload"));
    }
    let axis = |i: usize| f32::from(i16::from_be_bytes([data[2 * i], data[2 * i + 1]])) * scale;
    Ok([axis(0), axis(1), axis(2)])
}

pub struct SensorReader<B> {
    bus: B,
    devices: Vec<DeviceAddress, MAX_SENSORS>,
}

impl<B: FieldBus> SensorReader<B> {
    /// Devices beyond `MAX_SENSORS` are ignored; configuration rejects them first.
    pub fn new(bus: B, devices: &[DeviceAddress]) -> Self {
        let devices = devices.iter().copied().take(MAX_SENSORS).collect();
        Self { bus, devices }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceAddress] {
        &self.devices
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// One bus transaction; a failed transaction yields no sample.
    pub fn read(&mut self, sensor: SensorIndex, now: u64) -> Result<RawSample, SensorFault> {
        let device = *self.devices.get(sensor).ok_or(SensorFault {
            sensor,
            cause: BusFault::UnknownDevice(sensor),
        })?;

        let data = self
            .bus
            .transact(device.bus_id, device.register_range())
            .map_err(|cause| SensorFault { sensor, cause })?;

        let [x, y, z] = decode_axes(&data, device.scale).map_err(|cause| SensorFault { sensor, cause })?;
        let sample = RawSample::new(sensor, x, y, z, now);
        trace!(sensor, x, y, z, magnitude = sample.magnitude, "sample");
        Ok(sample)
    }
}
