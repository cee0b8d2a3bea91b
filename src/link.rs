//! Wireless link ownership and reconnection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NetworkCredentials;
use crate::error::LinkFault;
use crate::health::LinkHealth;
use crate::reconnect::{ConnectionState, ReconnectMachine, ReconnectPolicy};

/// Radio driver seam. Association may block for as long as the radio needs;
/// the manager bounds it with its own timeout.
pub trait NetworkInterface: Send {
    fn associate(
        &mut self,
        credentials: &NetworkCredentials,
    ) -> impl Future<Output = Result<(), LinkFault>> + Send;

    fn is_associated(&self) -> bool;

    fn disassociate(&mut self);
}

pub struct NetworkLinkManager<N> {
    interface: N,
    credentials: NetworkCredentials,
    machine: ReconnectMachine,
    health: Arc<LinkHealth>,
    association_timeout: Duration,
}

impl<N: NetworkInterface> NetworkLinkManager<N> {
    pub fn new(
        interface: N,
        credentials: NetworkCredentials,
        policy: ReconnectPolicy,
        association_timeout: Duration,
        health: Arc<LinkHealth>,
    ) -> Self {
        health.set_wifi_connected(false);
        Self {
            interface,
            credentials,
            machine: ReconnectMachine::new("wifi", policy),
            health,
            association_timeout,
        }
    }

    /// Non-blocking view of the link for other components.
    pub fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn machine(&self) -> &ReconnectMachine {
        &self.machine
    }

    pub fn interface(&self) -> &N {
        &self.interface
    }

    /// One servicing step: detect loss, honour forced re-association, and run
    /// at most one association attempt when the backoff allows it.
    pub async fn service(&mut self, now: u64) -> ConnectionState {
        if self.health.take_reassociate_request() && self.machine.is_connected() {
            warn!("forced re-association");
            self.interface.disassociate();
            self.machine.on_lost(now);
            self.health.set_wifi_connected(false);
        }

        if self.machine.is_connected() {
            if !self.interface.is_associated() {
                warn!(fault = %LinkFault::Lost, "wireless link dropped");
                self.machine.on_lost(now);
                self.health.set_wifi_connected(false);
            }
            return self.machine.state();
        }

        if !self.machine.ready_to_attempt(now) {
            return self.machine.state();
        }

        self.machine.begin_attempt(now);
        let attempt = tokio::time::timeout(
            self.association_timeout,
            self.interface.associate(&self.credentials),
        )
        .await
        .unwrap_or(Err(LinkFault::Timeout));

        match attempt {
            Ok(()) => {
                info!(ssid = %self.credentials.ssid, "associated");
                self.machine.on_success(now);
                self.health.set_wifi_connected(true);
            }
            Err(fault) => {
                warn!(%fault, attempt = self.machine.attempts_in_window(), "association failed");
                self.machine.on_failure(now);
            }
        }

        self.machine.state()
    }
}
