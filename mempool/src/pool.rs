//! The transaction pool the gossip reactor feeds and drains.
//!
//! [`TxPool`] is the narrow interface the reactor depends on. [`TxMempool`]
//! is an in-memory implementation with a dedup cache, size limits,
//! priority-based eviction and height-based expiry. Deciding whether a
//! transaction is valid is delegated to a [`TxChecker`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::cache::TxCache;
use crate::config::MempoolConfig;
use crate::gossip_queue::GossipQueue;
use crate::ids::UNKNOWN_PEER_ID;
use crate::tx::{PoolTx, TxInfo, TxKey};
use crate::MempoolError;

/// Pool operations the gossip reactor relies on.
pub trait TxPool: Send + Sync + 'static {
    /// Submit a transaction. `TxInCache` means it was seen before.
    fn check_tx(&self, tx: Bytes, info: TxInfo) -> Result<(), MempoolError>;

    /// Insertion-ordered view used by flood gossip.
    fn gossip_queue(&self) -> &GossipQueue;

    fn has_tx(&self, key: &TxKey) -> bool;

    /// Claim delivery of `tx` to `peer_id`. True only for the first claim.
    fn mark_delivered_to(&self, tx: &PoolTx, peer_id: u16) -> bool;

    /// Highest-priority entries, in priority order, up to `max_bytes` in
    /// total.
    fn priority_snapshot(&self, max_bytes: usize) -> Vec<Arc<PoolTx>>;
}

/// Application-side validity check.
pub trait TxChecker: Send + Sync + 'static {
    /// Priority of `tx`, or why it is rejected.
    fn check(&self, tx: &[u8]) -> Result<i64, String>;
}

/// Accepts every transaction at priority 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl TxChecker for AcceptAll {
    fn check(&self, _tx: &[u8]) -> Result<i64, String> {
        Ok(0)
    }
}

/// Cumulative admission counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub admitted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
}

pub struct TxMempool {
    config: MempoolConfig,
    checker: Arc<dyn TxChecker>,
    queue: GossipQueue,
    state: Mutex<PoolState>,
    counters: Counters,
}

struct PoolState {
    height: i64,
    txs: HashMap<TxKey, Arc<PoolTx>>,
    size_bytes: usize,
    cache: TxCache,
}

impl TxMempool {
    pub fn new(config: MempoolConfig, checker: Arc<dyn TxChecker>, height: i64) -> Self {
        let cache = TxCache::new(config.cache_size);
        Self {
            config,
            checker,
            queue: GossipQueue::new(),
            state: Mutex::new(PoolState {
                height,
                txs: HashMap::new(),
                size_bytes: 0,
                cache,
            }),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.lock().txs.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }

    pub fn height(&self) -> i64 {
        self.lock().height
    }

    pub fn get(&self, key: &TxKey) -> Option<Arc<PoolTx>> {
        self.lock().txs.get(key).cloned()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Drop a transaction from the pool. Its key stays cached.
    pub fn remove_tx(&self, key: &TxKey) -> bool {
        let mut state = self.lock();
        self.remove_locked(&mut state, key).is_some()
    }

    /// A new block was committed at `height` containing `committed`.
    ///
    /// Committed transactions leave the pool but stay cached so they are not
    /// re-admitted. With a TTL configured, entries admitted more than
    /// `ttl_num_blocks` ago are purged and forgotten by the cache.
    pub fn update(&self, height: i64, committed: &[Bytes]) {
        let mut state = self.lock();
        state.height = height;

        for tx in committed {
            let key = TxKey::of(tx);
            state.cache.push(key);
            self.remove_locked(&mut state, &key);
        }

        let ttl = self.config.ttl_num_blocks;
        if ttl > 0 {
            let expired: Vec<TxKey> = state
                .txs
                .values()
                .filter(|entry| height - entry.height() > ttl)
                .map(|entry| entry.key())
                .collect();
            for key in &expired {
                self.remove_locked(&mut state, key);
                state.cache.remove(key);
            }
            if !expired.is_empty() {
                self.counters
                    .expired
                    .fetch_add(expired.len() as u64, Ordering::Relaxed);
                debug!(count = expired.len(), height, "purged expired txs");
            }
        }
        trace!(height, size = state.txs.len(), "mempool updated");
    }

    /// Remove every transaction and clear the cache.
    pub fn flush(&self) {
        let mut state = self.lock();
        let keys: Vec<TxKey> = state.txs.keys().copied().collect();
        for key in &keys {
            self.remove_locked(&mut state, key);
        }
        state.cache.reset();
    }

    fn remove_locked(&self, state: &mut PoolState, key: &TxKey) -> Option<Arc<PoolTx>> {
        let entry = state.txs.remove(key)?;
        state.size_bytes -= entry.size();
        self.queue.remove(entry.seq());
        Some(entry)
    }

    /// Lower-priority entries whose removal makes room for `size` more
    /// bytes, or `None` if there are not enough of them.
    fn victims(&self, state: &PoolState, priority: i64, size: usize) -> Option<Vec<TxKey>> {
        let mut candidates: Vec<&Arc<PoolTx>> = state
            .txs
            .values()
            .filter(|entry| entry.priority() < priority)
            .collect();
        // Lowest priority first; among equals, the newest goes first.
        candidates.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| b.seq().cmp(&a.seq()))
        });

        let mut count = state.txs.len();
        let mut bytes = state.size_bytes;
        let mut victims = Vec::new();
        for entry in candidates {
            if count < self.config.size && bytes + size <= self.config.max_txs_bytes {
                break;
            }
            count -= 1;
            bytes -= entry.size();
            victims.push(entry.key());
        }
        (count < self.config.size && bytes + size <= self.config.max_txs_bytes).then_some(victims)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TxPool for TxMempool {
    fn check_tx(&self, tx: Bytes, info: TxInfo) -> Result<(), MempoolError> {
        let size = tx.len();
        if size > self.config.max_tx_bytes {
            return Err(MempoolError::TxTooLarge {
                size,
                max: self.config.max_tx_bytes,
            });
        }

        let key = TxKey::of(&tx);
        let mut state = self.lock();
        if !state.cache.push(key) {
            // Whoever sent it again already has it.
            if info.sender_id != UNKNOWN_PEER_ID {
                if let Some(entry) = state.txs.get(&key) {
                    entry.add_peer(info.sender_id);
                }
            }
            return Err(MempoolError::TxInCache);
        }

        let priority = match self.checker.check(&tx) {
            Ok(priority) => priority,
            Err(reason) => {
                if !self.config.keep_invalid_txs_in_cache {
                    state.cache.remove(&key);
                }
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(MempoolError::Rejected(reason));
            }
        };

        let full = state.txs.len() >= self.config.size
            || state.size_bytes + size > self.config.max_txs_bytes;
        if full {
            let Some(victims) = self.victims(&state, priority, size) else {
                state.cache.remove(&key);
                return Err(MempoolError::MempoolIsFull {
                    txs: state.txs.len(),
                    bytes: state.size_bytes,
                });
            };
            for victim in &victims {
                self.remove_locked(&mut state, victim);
                state.cache.remove(victim);
            }
            self.counters
                .evicted
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            debug!(evicted = victims.len(), priority, "evicted lower priority txs");
        }

        let height = state.height;
        let entry = self
            .queue
            .push_with(|seq| PoolTx::new(tx, key, priority, height, seq, info.sender_id));
        state.size_bytes += size;
        state.txs.insert(key, entry);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        trace!(tx = %key, priority, height, sender = info.sender_id, "tx admitted");
        Ok(())
    }

    fn gossip_queue(&self) -> &GossipQueue {
        &self.queue
    }

    fn has_tx(&self, key: &TxKey) -> bool {
        self.lock().txs.contains_key(key)
    }

    fn mark_delivered_to(&self, tx: &PoolTx, peer_id: u16) -> bool {
        tx.add_peer(peer_id)
    }

    fn priority_snapshot(&self, max_bytes: usize) -> Vec<Arc<PoolTx>> {
        let mut entries: Vec<Arc<PoolTx>> = self.lock().txs.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.seq().cmp(&b.seq()))
        });

        let mut total = 0;
        let keep = entries
            .iter()
            .take_while(|entry| {
                total += entry.size();
                total <= max_bytes
            })
            .count();
        entries.truncate(keep);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Priority is the first byte; a leading 0xff is rejected.
    struct FirstByte;

    impl TxChecker for FirstByte {
        fn check(&self, tx: &[u8]) -> Result<i64, String> {
            match tx.first() {
                Some(0xff) => Err("bad tx".into()),
                Some(b) => Ok(i64::from(*b)),
                None => Ok(0),
            }
        }
    }

    fn pool(config: MempoolConfig) -> TxMempool {
        TxMempool::new(config, Arc::new(FirstByte), 1)
    }

    fn tx(priority: u8, tag: u8, len: usize) -> Bytes {
        let mut data = vec![tag; len.max(2)];
        data[0] = priority;
        Bytes::from(data)
    }

    #[test]
    fn admits_and_tracks_size() {
        let pool = pool(MempoolConfig::default());
        pool.check_tx(tx(1, 1, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(1, 2, 20), TxInfo::local()).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.size_bytes(), 30);
        assert!(pool.has_tx(&TxKey::of(&tx(1, 1, 10))));
        assert_eq!(pool.stats().admitted, 2);
    }

    #[test]
    fn duplicates_hit_the_cache_and_record_the_sender() {
        let pool = pool(MempoolConfig::default());
        let t = tx(1, 1, 10);
        pool.check_tx(t.clone(), TxInfo::local()).unwrap();
        assert_eq!(
            pool.check_tx(t.clone(), TxInfo { sender_id: 7, sender_peer: None }),
            Err(MempoolError::TxInCache)
        );
        assert!(pool.get(&TxKey::of(&t)).unwrap().has_peer(7));
    }

    #[test]
    fn oversize_tx_is_rejected_before_anything_else() {
        let pool = pool(MempoolConfig {
            max_tx_bytes: 8,
            ..Default::default()
        });
        assert_eq!(
            pool.check_tx(tx(1, 1, 9), TxInfo::local()),
            Err(MempoolError::TxTooLarge { size: 9, max: 8 })
        );
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn rejected_tx_can_be_resubmitted_unless_kept_in_cache() {
        let bad = tx(0xff, 1, 4);

        let forgetful = pool(MempoolConfig::default());
        assert!(matches!(forgetful.check_tx(bad.clone(), TxInfo::local()), Err(MempoolError::Rejected(_))));
        assert!(matches!(forgetful.check_tx(bad.clone(), TxInfo::local()), Err(MempoolError::Rejected(_))));

        let sticky = pool(MempoolConfig {
            keep_invalid_txs_in_cache: true,
            ..Default::default()
        });
        assert!(matches!(sticky.check_tx(bad.clone(), TxInfo::local()), Err(MempoolError::Rejected(_))));
        assert_eq!(sticky.check_tx(bad, TxInfo::local()), Err(MempoolError::TxInCache));
    }

    #[test]
    fn full_pool_evicts_only_lower_priority() {
        let pool = pool(MempoolConfig {
            size: 2,
            ..Default::default()
        });
        pool.check_tx(tx(5, 1, 4), TxInfo::local()).unwrap();
        pool.check_tx(tx(3, 2, 4), TxInfo::local()).unwrap();

        // Equal priority cannot displace anything.
        assert!(matches!(
            pool.check_tx(tx(3, 3, 4), TxInfo::local()),
            Err(MempoolError::MempoolIsFull { .. })
        ));

        pool.check_tx(tx(9, 4, 4), TxInfo::local()).unwrap();
        assert_eq!(pool.size(), 2);
        assert!(!pool.has_tx(&TxKey::of(&tx(3, 2, 4))));
        assert!(pool.has_tx(&TxKey::of(&tx(5, 1, 4))));
        assert_eq!(pool.stats().evicted, 1);
        // The evicted tx may come back later.
        assert!(matches!(
            pool.check_tx(tx(3, 2, 4), TxInfo::local()),
            Err(MempoolError::MempoolIsFull { .. })
        ));
    }

    #[test]
    fn byte_limit_evicts_enough_to_fit() {
        let pool = pool(MempoolConfig {
            max_txs_bytes: 30,
            ..Default::default()
        });
        pool.check_tx(tx(1, 1, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(1, 2, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(2, 3, 10), TxInfo::local()).unwrap();

        pool.check_tx(tx(3, 4, 20), TxInfo::local()).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.size_bytes(), 30);
        assert!(pool.has_tx(&TxKey::of(&tx(2, 3, 10))));
    }

    #[test]
    fn update_removes_committed_and_keeps_them_cached() {
        let pool = pool(MempoolConfig::default());
        let t = tx(1, 1, 10);
        pool.check_tx(t.clone(), TxInfo::local()).unwrap();

        pool.update(2, &[t.clone()]);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.height(), 2);
        assert!(pool.gossip_queue().is_empty());
        assert_eq!(pool.check_tx(t, TxInfo::local()), Err(MempoolError::TxInCache));
    }

    #[test]
    fn update_purges_by_ttl() {
        let pool = pool(MempoolConfig {
            ttl_num_blocks: 2,
            ..Default::default()
        });
        let old = tx(1, 1, 10);
        pool.check_tx(old.clone(), TxInfo::local()).unwrap();
        pool.update(3, &[]);
        let young = tx(1, 2, 10);
        pool.check_tx(young.clone(), TxInfo::local()).unwrap();

        pool.update(4, &[]);
        assert!(!pool.has_tx(&TxKey::of(&old)));
        assert!(pool.has_tx(&TxKey::of(&young)));
        assert_eq!(pool.stats().expired, 1);
        // Expired txs are forgotten and may be resubmitted.
        pool.check_tx(old, TxInfo::local()).unwrap();
    }

    #[test]
    fn snapshot_is_priority_ordered_and_budgeted() {
        let pool = pool(MempoolConfig::default());
        pool.check_tx(tx(1, 1, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(9, 2, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(5, 3, 10), TxInfo::local()).unwrap();
        pool.check_tx(tx(5, 4, 10), TxInfo::local()).unwrap();

        let all: Vec<(i64, u8)> = pool
            .priority_snapshot(usize::MAX)
            .iter()
            .map(|e| (e.priority(), e.tx()[1]))
            .collect();
        assert_eq!(all, vec![(9, 2), (5, 3), (5, 4), (1, 1)]);

        let budgeted = pool.priority_snapshot(25);
        assert_eq!(budgeted.len(), 2);
    }

    #[test]
    fn delivery_claim_is_won_once() {
        let pool = pool(MempoolConfig::default());
        let t = tx(1, 1, 10);
        pool.check_tx(t.clone(), TxInfo::local()).unwrap();
        let entry = pool.get(&TxKey::of(&t)).unwrap();
        assert!(pool.mark_delivered_to(&entry, 3));
        assert!(!pool.mark_delivered_to(&entry, 3));
        assert!(pool.mark_delivered_to(&entry, 4));
    }

    #[test]
    fn removal_drops_the_entry_from_the_gossip_queue() {
        let pool = pool(MempoolConfig::default());
        let a = tx(1, 1, 10);
        let b = tx(1, 2, 10);
        pool.check_tx(a.clone(), TxInfo::local()).unwrap();
        pool.check_tx(b.clone(), TxInfo::local()).unwrap();
        assert!(pool.remove_tx(&TxKey::of(&a)));
        assert!(!pool.remove_tx(&TxKey::of(&a)));

        let mut cursor = pool.gossip_queue().cursor_front();
        let first = pool.gossip_queue().peek(&mut cursor).unwrap();
        assert_eq!(first.tx(), &b);
    }

    #[test]
    fn flush_empties_pool_and_cache() {
        let pool = pool(MempoolConfig::default());
        let t = tx(1, 1, 10);
        pool.check_tx(t.clone(), TxInfo::local()).unwrap();
        pool.flush();
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.size_bytes(), 0);
        pool.check_tx(t, TxInfo::local()).unwrap();
    }
}
