//! Mempool configuration (`[mempool]`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Gossip transactions to peers. Inbound admission works either way.
    #[serde(default = "default_broadcast")]
    pub broadcast: bool,

    /// Maximum number of transactions held.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Maximum total bytes of all transactions held.
    #[serde(default = "default_max_txs_bytes")]
    pub max_txs_bytes: usize,

    /// Recently seen transaction keys remembered for deduplication.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_max_tx_bytes")]
    pub max_tx_bytes: usize,

    /// Blocks a transaction may stay in the pool. Zero keeps it forever.
    #[serde(default)]
    pub ttl_num_blocks: i64,

    /// Leave rejected transactions in the dedup cache so they are not
    /// re-checked.
    #[serde(default)]
    pub keep_invalid_txs_in_cache: bool,

    /// How often the priority snapshot is recomputed.
    #[serde(default = "default_priority_interval_ms")]
    pub priority_interval_ms: u64,

    /// Byte budget of one priority snapshot.
    #[serde(default = "default_priority_broadcast_max_bytes")]
    pub priority_broadcast_max_bytes: usize,

    /// Backoff while a peer has no height or lags behind a transaction.
    #[serde(default = "default_peer_catchup_sleep_ms")]
    pub peer_catchup_sleep_ms: u64,
}

fn default_broadcast() -> bool {
    true
}

fn default_size() -> usize {
    5000
}

fn default_max_txs_bytes() -> usize {
    1024 * 1024 * 1024
}

fn default_cache_size() -> usize {
    10_000
}

fn default_max_tx_bytes() -> usize {
    1024 * 1024
}

fn default_priority_interval_ms() -> u64 {
    10_000
}

fn default_priority_broadcast_max_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_peer_catchup_sleep_ms() -> u64 {
    100
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            broadcast: default_broadcast(),
            size: default_size(),
            max_txs_bytes: default_max_txs_bytes(),
            cache_size: default_cache_size(),
            max_tx_bytes: default_max_tx_bytes(),
            ttl_num_blocks: 0,
            keep_invalid_txs_in_cache: false,
            priority_interval_ms: default_priority_interval_ms(),
            priority_broadcast_max_bytes: default_priority_broadcast_max_bytes(),
            peer_catchup_sleep_ms: default_peer_catchup_sleep_ms(),
        }
    }
}

impl MempoolConfig {
    pub fn priority_interval(&self) -> Duration {
        Duration::from_millis(self.priority_interval_ms)
    }

    pub fn peer_catchup_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_catchup_sleep_ms)
    }
}
