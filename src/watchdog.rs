use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartReason {
    /// The acquisition loop stopped kicking.
    AcquisitionStalled { silent_ms: u64 },
    /// Critical health persisted across evaluations.
    HealthCritical,
}

impl core::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RestartReason::AcquisitionStalled { silent_ms } => {
                write!(f, "acquisition stalled for {} ms", silent_ms)
            }
            RestartReason::HealthCritical => write!(f, "persistent critical health"),
        }
    }
}

/// Software watchdog. The first restart request wins; later ones are ignored
/// until the node is rebuilt with a fresh watchdog.
#[derive(Debug)]
pub struct Watchdog {
    deadline_ms: u64,
    last_kick: AtomicU64,
    reason: Mutex<Option<RestartReason>>,
    notify: Notify,
}

impl Watchdog {
    pub fn new(deadline_ms: u64, now: u64) -> Self {
        Self {
            deadline_ms,
            last_kick: AtomicU64::new(now),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn kick(&self, now: u64) {
        self.last_kick.fetch_max(now, Ordering::AcqRel);
    }

    pub fn last_kick(&self) -> u64 {
        self.last_kick.load(Ordering::Acquire)
    }

    /// Raises a restart when the last kick is older than the deadline.
    pub fn check(&self, now: u64) -> Option<RestartReason> {
        let silent_ms = now.saturating_sub(self.last_kick());
        if silent_ms > self.deadline_ms {
            let reason = RestartReason::AcquisitionStalled { silent_ms };
            self.request_restart(reason);
            return Some(reason);
        }
        None
    }

    pub fn request_restart(&self, reason: RestartReason) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(%reason, "restart requested");
            *slot = Some(reason);
            self.notify.notify_one();
        }
    }

    pub fn restart_requested(&self) -> Option<RestartReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn wait_for_restart(&self) -> RestartReason {
        loop {
            if let Some(reason) = self.restart_requested() {
                return reason;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_miss() {
        let watchdog = Watchdog::new(2_000, 0);
        watchdog.kick(1_000);
        assert_eq!(watchdog.check(3_000), None);
        assert_eq!(
            watchdog.check(3_001),
            Some(RestartReason::AcquisitionStalled { silent_ms: 2_001 })
        );
    }

    #[test]
    fn test_first_reason_wins() {
        let watchdog = Watchdog::new(100, 0);
        watchdog.request_restart(RestartReason::HealthCritical);
        watchdog.check(10_000);
        assert_eq!(watchdog.restart_requested(), Some(RestartReason::HealthCritical));
    }

    #[tokio::test]
    async fn test_wait_after_request() {
        let watchdog = Watchdog::new(100, 0);
        watchdog.request_restart(RestartReason::HealthCritical);
        assert_eq!(watchdog.wait_for_restart().await, RestartReason::HealthCritical);
    }
}
