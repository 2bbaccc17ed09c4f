//! Bounded LRU set of recently seen transaction keys.
//!
//! Stops the pool from re-checking a transaction it has already seen,
//! whether it was admitted, rejected or has since left the pool.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::tx::TxKey;

pub struct TxCache {
    /// `None` when the configured capacity is zero.
    keys: Option<LruCache<TxKey, ()>>,
}

impl TxCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Record `key` as most recently seen.
    ///
    /// Returns `false` if it was already cached. A zero capacity caches
    /// nothing and always returns `true`.
    pub fn push(&mut self, key: TxKey) -> bool {
        let Some(keys) = &mut self.keys else {
            return true;
        };
        if keys.contains(&key) {
            keys.promote(&key);
            return false;
        }
        keys.put(key, ());
        true
    }

    pub fn remove(&mut self, key: &TxKey) {
        if let Some(keys) = &mut self.keys {
            keys.pop(key);
        }
    }

    pub fn contains(&self, key: &TxKey) -> bool {
        self.keys.as_ref().is_some_and(|keys| keys.contains(key))
    }

    pub fn reset(&mut self) {
        if let Some(keys) = &mut self.keys {
            keys.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
