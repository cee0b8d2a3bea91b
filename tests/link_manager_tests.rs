use std::sync::Arc;
use std::time::Duration;

use vibemon::sim::{SimulatedWifi, WifiControl};
use vibemon::*;

fn credentials() -> NetworkCredentials {
    NetworkCredentials {
        ssid: "plant-floor".into(),
        password: "secret".into(),
    }
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
    }
}

fn manager() -> (NetworkLinkManager<SimulatedWifi>, WifiControl, Arc<LinkHealth>) {
    let (wifi, control) = SimulatedWifi::for_ssid("plant-floor");
    let health = Arc::new(LinkHealth::new());
    let manager = NetworkLinkManager::new(wifi, credentials(), policy(), Duration::from_millis(50), health.clone());
    (manager, control, health)
}

#[tokio::test]
async fn test_connects_through_connecting() {
    let (mut manager, control, health) = manager();
    control.fail_next(1);

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.service(0).await, ConnectionState::Connecting);
    assert!(!manager.is_connected());
    assert!(!health.wifi_connected());

    // Backoff not yet elapsed: no attempt.
    assert_eq!(manager.service(50).await, ConnectionState::Connecting);
    assert_eq!(control.attempts(), 1);

    assert_eq!(manager.service(100).await, ConnectionState::Connected);
    assert!(manager.is_connected());
    assert!(health.wifi_connected());
}

#[tokio::test]
async fn test_repeated_failure_respects_attempt_cap() {
    let (mut manager, control, _) = manager();
    control.set_in_range(false);

    let mut now = 0;
    let mut seen_disconnected_after_connecting = false;
    let mut previous = manager.state();

    for _ in 0..20 {
        let state = manager.service(now).await;
        assert!(manager.machine().attempts_in_window() <= policy().max_attempts);
        if previous == ConnectionState::Connecting && state == ConnectionState::Disconnected {
            seen_disconnected_after_connecting = true;
        }
        previous = state;
        now = manager.machine().next_attempt_at().max(now + 1);
    }

    assert!(seen_disconnected_after_connecting);
    assert!(manager.machine().stats().windows_exhausted >= 2);
    assert_ne!(manager.state(), ConnectionState::Connected);

    // Back in range: the next window connects.
    control.set_in_range(true);
    let mut state = manager.state();
    for _ in 0..5 {
        state = manager.service(now).await;
        if state == ConnectionState::Connected {
            break;
        }
        now = manager.machine().next_attempt_at().max(now + 1);
    }
    assert_eq!(state, ConnectionState::Connected);
    assert!(control.attempts() > 6);
}

#[tokio::test]
async fn test_wrong_network_is_not_found() {
    let (wifi, control) = SimulatedWifi::for_ssid("other");
    let health = Arc::new(LinkHealth::new());
    let mut manager = NetworkLinkManager::new(wifi, credentials(), policy(), Duration::from_millis(50), health);

    assert_eq!(manager.service(0).await, ConnectionState::Connecting);
    assert!(!control.is_associated());
}

#[tokio::test]
async fn test_loss_is_detected_and_recovered() {
    let (mut manager, control, health) = manager();
    assert_eq!(manager.service(0).await, ConnectionState::Connected);

    control.drop_association();
    assert_eq!(manager.service(10).await, ConnectionState::Disconnected);
    assert!(!health.wifi_connected());
    assert_eq!(manager.machine().stats().losses, 1);

    assert_eq!(manager.service(20).await, ConnectionState::Connected);
    assert!(health.wifi_connected());
}

#[tokio::test]
async fn test_forced_reassociation() {
    let (mut manager, control, health) = manager();
    manager.service(0).await;
    assert_eq!(control.attempts(), 1);

    health.request_reassociation();
    assert_eq!(manager.service(10).await, ConnectionState::Connected);
    assert_eq!(control.attempts(), 2);
    assert_eq!(manager.machine().stats().losses, 1);

    // The request is consumed.
    manager.service(20).await;
    assert_eq!(control.attempts(), 2);
}

struct SilentRadio;

impl NetworkInterface for SilentRadio {
    async fn associate(&mut self, _credentials: &NetworkCredentials) -> Result<(), LinkFault> {
        std::future::pending::<Result<(), LinkFault>>().await
    }

    fn is_associated(&self) -> bool {
        false
    }

    fn disassociate(&mut self) {}
}

#[tokio::test]
async fn test_hung_association_times_out() {
    let health = Arc::new(LinkHealth::new());
    let mut manager = NetworkLinkManager::new(SilentRadio, credentials(), policy(), Duration::from_millis(20), health);

    assert_eq!(manager.service(0).await, ConnectionState::Connecting);
    assert_eq!(manager.machine().stats().failures, 1);
}
