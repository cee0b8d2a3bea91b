//! Reconnect state machine shared by the wireless link and the broker session.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`. While
//! connecting, failed attempts are spaced by a doubling backoff. Once the
//! attempt cap for a window is reached the machine drops back to
//! `Disconnected`, resets the backoff and waits one cool-down before the next
//! window. Loss of connectivity is never terminal.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u8,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReconnectStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub losses: u32,
    pub windows_exhausted: u32,
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    name: &'static str,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts_in_window: u8,
    backoff_ms: u64,
    next_attempt_at: u64,
    stats: ReconnectStats,
}

impl ReconnectMachine {
    pub fn new(name: &'static str, policy: ReconnectPolicy) -> Self {
        Self {
            name,
            policy,
            state: ConnectionState::Disconnected,
            attempts_in_window: 0,
            backoff_ms: policy.initial_backoff_ms,
            next_attempt_at: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts_in_window(&self) -> u8 {
        self.attempts_in_window
    }

    pub fn next_attempt_at(&self) -> u64 {
        self.next_attempt_at
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// True when an attempt may be started at `now`.
    pub fn ready_to_attempt(&self, now: u64) -> bool {
        self.state != ConnectionState::Connected && now >= self.next_attempt_at
    }

    pub fn begin_attempt(&mut self, now: u64) {
        debug_assert!(self.ready_to_attempt(now), "{} attempt started early", self.name);
        if self.state == ConnectionState::Disconnected {
            info!(link = self.name, "connecting");
        }
        self.state = ConnectionState::Connecting;
        self.attempts_in_window = self.attempts_in_window.saturating_add(1);
        self.stats.attempts = self.stats.attempts.saturating_add(1);

        debug_assert!(
            self.attempts_in_window <= self.policy.max_attempts,
            "{} attempts {} exceed cap {}",
            self.name,
            self.attempts_in_window,
            self.policy.max_attempts
        );
    }

    pub fn on_success(&mut self, now: u64) {
        info!(link = self.name, attempts = self.attempts_in_window, at = now, "connected");
        self.state = ConnectionState::Connected;
        self.stats.successes = self.stats.successes.saturating_add(1);
        self.reset_window();
    }

    pub fn on_failure(&mut self, now: u64) {
        self.stats.failures = self.stats.failures.saturating_add(1);

        if self.attempts_in_window >= self.policy.max_attempts {
            warn!(
                link = self.name,
                attempts = self.attempts_in_window,
                cooldown_ms = self.policy.max_backoff_ms,
                "retry window exhausted"
            );
            self.state = ConnectionState::Disconnected;
            self.stats.windows_exhausted = self.stats.windows_exhausted.saturating_add(1);
            self.reset_window();
            self.next_attempt_at = now.saturating_add(self.policy.max_backoff_ms);
        } else {
            self.next_attempt_at = now.saturating_add(self.backoff_ms);
            self.backoff_ms = self.backoff_ms.saturating_mul(2).min(self.policy.max_backoff_ms);
        }
    }

    /// Connectivity dropped while connected; the next attempt may start at once.
    pub fn on_lost(&mut self, now: u64) {
        if self.state == ConnectionState::Connected {
            warn!(link = self.name, at = now, "connection lost");
            self.stats.losses = self.stats.losses.saturating_add(1);
        }
        self.state = ConnectionState::Disconnected;
        self.reset_window();
        self.next_attempt_at = now;
    }

    fn reset_window(&mut self) {
        self.attempts_in_window = 0;
        self.backoff_ms = self.policy.initial_backoff_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }

    #[test]
    fn test_backoff_doubles_within_window() {
        let mut m = ReconnectMachine::new("test", policy());
        m.begin_attempt(0);
        m.on_failure(0);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.next_attempt_at(), 100);
        assert!(!m.ready_to_attempt(99));

        m.begin_attempt(100);
        m.on_failure(100);
        assert_eq!(m.next_attempt_at(), 300);
    }

    #[test]
    fn test_window_exhaustion_resets_backoff() {
        let mut m = ReconnectMachine::new("test", policy());
        let mut now = 0;
        for _ in 0..3 {
            assert!(m.ready_to_attempt(now));
            m.begin_attempt(now);
            m.on_failure(now);
            now = m.next_attempt_at();
        }
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.attempts_in_window(), 0);
        assert_eq!(m.stats().windows_exhausted, 1);

        // Fresh window starts from the initial backoff again.
        m.begin_attempt(now);
        m.on_failure(now);
        assert_eq!(m.next_attempt_at(), now + 100);
    }

    #[test]
    fn test_loss_allows_immediate_retry() {
        let mut m = ReconnectMachine::new("test", policy());
        m.begin_attempt(0);
        m.on_success(5);
        assert!(!m.ready_to_attempt(10));

        m.on_lost(50);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.ready_to_attempt(50));
        assert_eq!(m.stats().losses, 1);
    }
}
