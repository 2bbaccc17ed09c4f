//! Tunables of a multiplexed connection (`[p2p.connection]`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::NetworkError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MConnConfig {
    /// Outbound ceiling in bytes per second. Zero or less disables pacing.
    #[serde(default = "default_rate")]
    pub send_rate: i64,

    /// Inbound ceiling in bytes per second. Zero or less disables pacing.
    #[serde(default = "default_rate")]
    pub recv_rate: i64,

    /// Largest payload carried by a single message packet.
    #[serde(default = "default_max_packet_msg_payload_size")]
    pub max_packet_msg_payload_size: usize,

    /// Longest a buffered write may wait before being flushed.
    #[serde(default = "default_flush_throttle_ms")]
    pub flush_throttle_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Must be shorter than the ping interval.
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    /// Packets written from one channel before the writer re-picks.
    #[serde(default = "default_max_send_batch_packets")]
    pub max_send_batch_packets: usize,
}

fn default_rate() -> i64 {
    5_120_000
}

fn default_max_packet_msg_payload_size() -> usize {
    1024
}

fn default_flush_throttle_ms() -> u64 {
    100
}

fn default_ping_interval_ms() -> u64 {
    60_000
}

fn default_pong_timeout_ms() -> u64 {
    45_000
}

fn default_max_send_batch_packets() -> usize {
    10
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            send_rate: default_rate(),
            recv_rate: default_rate(),
            max_packet_msg_payload_size: default_max_packet_msg_payload_size(),
            flush_throttle_ms: default_flush_throttle_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            max_send_batch_packets: default_max_send_batch_packets(),
        }
    }
}

impl MConnConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.max_packet_msg_payload_size == 0 {
            return Err(NetworkError::InvalidConfig(
                "max_packet_msg_payload_size must be positive".into(),
            ));
        }
        if self.max_send_batch_packets == 0 {
            return Err(NetworkError::InvalidConfig(
                "max_send_batch_packets must be positive".into(),
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(NetworkError::InvalidConfig(
                "ping_interval_ms must be positive".into(),
            ));
        }
        if self.pong_timeout_ms >= self.ping_interval_ms {
            return Err(NetworkError::InvalidConfig(format!(
                "pong_timeout_ms ({}) must be less than ping_interval_ms ({})",
                self.pong_timeout_ms, self.ping_interval_ms
            )));
        }
        Ok(())
    }

    pub fn flush_throttle(&self) -> Duration {
        Duration::from_millis(self.flush_throttle_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Full encoded size of a maximal message packet, length prefix included.
    pub fn max_packet_size(&self) -> usize {
        halyard_messages::max_packet_msg_size(self.max_packet_msg_payload_size)
    }
}
