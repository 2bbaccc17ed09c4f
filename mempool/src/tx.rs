//! Pool entries and transaction keys.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use halyard_network::PeerId;
use sha2::{Digest, Sha256};

/// SHA-256 of the raw transaction bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxKey([u8; 32]);

impl TxKey {
    pub fn of(tx: &[u8]) -> Self {
        Self(Sha256::digest(tx).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxKey({})", hex::encode(&self.0[..8]))
    }
}

/// Who handed a transaction to the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxInfo {
    /// Registry handle of the sending peer; 0 for local submissions.
    pub sender_id: u16,
    pub sender_peer: Option<PeerId>,
}

impl TxInfo {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn from_peer(sender_id: u16, peer: PeerId) -> Self {
        Self {
            sender_id,
            sender_peer: Some(peer),
        }
    }
}

/// A transaction admitted to the pool.
///
/// Immutable apart from the set of peers known to have it, which only
/// grows.
pub struct PoolTx {
    key: TxKey,
    tx: Bytes,
    priority: i64,
    height: i64,
    seq: u64,
    admitted_at: Instant,
    peers: Mutex<HashSet<u16>>,
}

impl PoolTx {
    pub(crate) fn new(tx: Bytes, key: TxKey, priority: i64, height: i64, seq: u64, sender_id: u16) -> Self {
        let mut peers = HashSet::new();
        if sender_id != crate::ids::UNKNOWN_PEER_ID {
            peers.insert(sender_id);
        }
        Self {
            key,
            tx,
            priority,
            height,
            seq,
            admitted_at: Instant::now(),
            peers: Mutex::new(peers),
        }
    }

    pub fn key(&self) -> TxKey {
        self.key
    }

    pub fn tx(&self) -> &Bytes {
        &self.tx
    }

    pub fn size(&self) -> usize {
        self.tx.len()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Pool height when the transaction was admitted.
    pub fn height(&self) -> i64 {
        self.height
    }

    /// Position in the gossip queue.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    pub fn has_peer(&self, id: u16) -> bool {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).contains(&id)
    }

    /// Record that `id` has the transaction. Returns false if it already
    /// was recorded.
    pub(crate) fn add_peer(&self, id: u16) -> bool {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).insert(id)
    }
}

impl fmt::Debug for PoolTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolTx")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("priority", &self.priority)
            .field("height", &self.height)
            .field("seq", &self.seq)
            .finish()
    }
}
