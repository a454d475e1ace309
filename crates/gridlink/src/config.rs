use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::PacketLossSimulation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Period of the shared resend/ack-flush sweep.
    pub resend_interval_ms: u64,
    /// How long a reliable message waits for its ack before each resend.
    pub resend_timeout_ms: u64,
    pub max_resends: u32,
    pub ack_flush_delay_ms: u64,
    pub max_appended_acks: usize,
    pub dedup_window: usize,
    pub max_pending_acks: usize,
    pub connect_timeout_ms: u64,
    pub circuit_timeout_secs: u64,
    pub teleport_timeout_ms: u64,
    pub resolve_attempts: u32,
    pub resolve_backoff_ms: u64,
    pub previous_circuit_linger_ms: u64,
    pub recv_poll_ms: u64,
    pub loss_simulation: Option<PacketLossSimulation>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: 100,
            resend_timeout_ms: 1000,
            max_resends: 3,
            ack_flush_delay_ms: 100,
            max_appended_acks: 250,
            dedup_window: 1024,
            max_pending_acks: 512,
            connect_timeout_ms: 5000,
            circuit_timeout_secs: 60,
            teleport_timeout_ms: 18000,
            resolve_attempts: 5,
            resolve_backoff_ms: 1000,
            previous_circuit_linger_ms: 10_000,
            recv_poll_ms: 50,
            loss_simulation: None,
        }
    }
}

impl ClientConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    pub fn ack_flush_delay(&self) -> Duration {
        Duration::from_millis(self.ack_flush_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }

    pub fn teleport_timeout(&self) -> Duration {
        Duration::from_millis(self.teleport_timeout_ms)
    }

    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    pub fn previous_circuit_linger(&self) -> Duration {
        Duration::from_millis(self.previous_circuit_linger_ms)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms.max(1))
    }

    /// Upper bound on how long a blocking teleport can legitimately take:
    /// name resolution, the server-side deadline and the destination connect.
    pub fn teleport_wait_limit(&self) -> Duration {
        self.resolve_backoff() * self.resolve_attempts
            + self.teleport_timeout()
            + self.connect_timeout()
            + Duration::from_secs(1)
    }
}
