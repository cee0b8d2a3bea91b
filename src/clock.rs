use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since power-on, shared by every task of one boot.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    boot: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self { boot: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    pub fn boot_instant(&self) -> Instant {
        self.boot
    }
}

/// Maps device time onto wall-clock epoch milliseconds for published payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    boot_epoch_ms: u64,
}

impl TimeBase {
    pub fn new(boot_epoch_ms: u64) -> Self {
        Self { boot_epoch_ms }
    }

    /// Falls back to device-local time when the wall clock is unset.
    pub fn from_system_time() -> Self {
        let boot_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { boot_epoch_ms }
    }

    pub fn to_epoch(&self, device_ms: u64) -> u64 {
        self.boot_epoch_ms.saturating_add(device_ms)
    }
}
