//! Insertion-ordered view of the pool that gossip readers walk.
//!
//! Every admitted transaction gets the next absolute sequence number and
//! is stored under it. Removing a transaction drops its entry outright, so
//! the queue only ever holds live entries. Readers keep a [`Cursor`] (just
//! the next sequence they want), so removals never invalidate them: a
//! cursor whose entry is gone moves on to the next live sequence.
//!
//! Appends are announced through a `watch` channel carrying the tail
//! sequence, which readers at the end of the queue wait on.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::tx::PoolTx;

/// A reader's position in the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    next: u64,
}

impl Cursor {
    /// The next sequence this cursor will look at.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Move past `entry`.
    pub fn advance(&mut self, entry: &PoolTx) {
        self.next = self.next.max(entry.seq() + 1);
    }
}

pub struct GossipQueue {
    inner: RwLock<Slots>,
    tail: watch::Sender<u64>,
}

struct Slots {
    /// Sequence the next append gets.
    next_seq: u64,
    entries: BTreeMap<u64, Arc<PoolTx>>,
}

impl GossipQueue {
    pub fn new() -> Self {
        let (tail, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Slots {
                next_seq: 0,
                entries: BTreeMap::new(),
            }),
            tail,
        }
    }

    /// Append the entry built for the next sequence number.
    pub(crate) fn push_with(&self, build: impl FnOnce(u64) -> PoolTx) -> Arc<PoolTx> {
        let (entry, tail) = {
            let mut slots = self.write();
            let seq = slots.next_seq;
            let entry = Arc::new(build(seq));
            slots.entries.insert(seq, entry.clone());
            slots.next_seq = seq + 1;
            (entry, seq + 1)
        };
        self.tail.send_replace(tail);
        entry
    }

    /// Drop the entry at `seq`. Returns it if it was live.
    pub(crate) fn remove(&self, seq: u64) -> Option<Arc<PoolTx>> {
        self.write().entries.remove(&seq)
    }

    /// A cursor at the oldest entry.
    pub fn cursor_front(&self) -> Cursor {
        Cursor::default()
    }

    /// A cursor just past `last_seen`, or at the front if `None`.
    pub fn cursor_from(&self, last_seen: Option<u64>) -> Cursor {
        Cursor {
            next: last_seen.map_or(0, |seq| seq + 1),
        }
    }

    /// The first live entry at or after `cursor`, without consuming it.
    ///
    /// Moves the cursor over removed sequences, up to the tail if nothing
    /// live is left.
    pub fn peek(&self, cursor: &mut Cursor) -> Option<Arc<PoolTx>> {
        let slots = self.read();
        match slots.entries.range(cursor.next..).next() {
            Some((&seq, entry)) => {
                cursor.next = seq;
                Some(entry.clone())
            }
            None => {
                cursor.next = cursor.next.max(slots.next_seq);
                None
            }
        }
    }

    /// Complete once something is appended at or after `cursor`.
    pub async fn wait_for_entry(&self, cursor: &Cursor) {
        let mut tail = self.tail.subscribe();
        let _ = tail.wait_for(|tail| *tail > cursor.next).await;
    }

    /// Tail signal: the sequence the next append will get.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tail.subscribe()
    }

    pub fn tail(&self) -> u64 {
        *self.tail.borrow()
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for GossipQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxKey;
    use bytes::Bytes;
    use std::time::Duration;

    fn push(queue: &GossipQueue, n: u8) -> Arc<PoolTx> {
        let tx = Bytes::from(vec![n]);
        queue.push_with(|seq| PoolTx::new(tx.clone(), TxKey::of(&tx), 0, 1, seq, 0))
    }

    fn drain(queue: &GossipQueue, cursor: &mut Cursor) -> Vec<u8> {
        let mut seen = Vec::new();
        while let Some(entry) = queue.peek(cursor) {
            seen.push(entry.tx()[0]);
            cursor.advance(&entry);
        }
        seen
    }

    #[test]
    fn readers_see_insertion_order() {
        let queue = GossipQueue::new();
        for n in 0..5 {
            push(&queue, n);
        }
        let mut cursor = queue.cursor_front();
        assert_eq!(drain(&queue, &mut cursor), vec![0, 1, 2, 3, 4]);
        assert_eq!(cursor.position(), 5);
        assert_eq!(queue.tail(), 5);
    }

    #[test]
    fn removed_entries_are_skipped() {
        let queue = GossipQueue::new();
        let entries: Vec<_> = (0..5).map(|n| push(&queue, n)).collect();
        queue.remove(entries[2].seq());
        queue.remove(entries[3].seq());

        let mut cursor = queue.cursor_front();
        assert_eq!(drain(&queue, &mut cursor), vec![0, 1, 4]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn cursor_on_a_removed_entry_moves_on() {
        let queue = GossipQueue::new();
        let entries: Vec<_> = (0..4).map(|n| push(&queue, n)).collect();
        let mut cursor = queue.cursor_front();
        assert_eq!(queue.peek(&mut cursor).unwrap().seq(), 0);

        queue.remove(entries[0].seq());
        queue.remove(entries[1].seq());
        assert_eq!(drain(&queue, &mut cursor), vec![2, 3]);
    }

    #[test]
    fn cursor_from_last_seen_resumes_after_it() {
        let queue = GossipQueue::new();
        for n in 0..3 {
            push(&queue, n);
        }
        let mut cursor = queue.cursor_from(Some(0));
        assert_eq!(drain(&queue, &mut cursor), vec![1, 2]);
        let mut cursor = queue.cursor_from(None);
        assert_eq!(drain(&queue, &mut cursor), vec![0, 1, 2]);
    }

    #[test]
    fn removing_twice_is_a_no_op() {
        let queue = GossipQueue::new();
        let entry = push(&queue, 1);
        assert!(queue.remove(entry.seq()).is_some());
        assert!(queue.remove(entry.seq()).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn churn_behind_a_long_lived_head_is_not_retained() {
        let queue = GossipQueue::new();
        push(&queue, 0);
        for n in 0..100_000u32 {
            let entry = push(&queue, (n % 200) as u8 + 1);
            queue.remove(entry.seq());
        }
        assert_eq!(queue.len(), 1);
        assert!(queue.read().entries.len() < 1000);

        let mut cursor = queue.cursor_front();
        assert_eq!(drain(&queue, &mut cursor), vec![0]);
        assert_eq!(cursor.position(), queue.tail());
        assert_eq!(queue.tail(), 100_001);
    }

    #[tokio::test]
    async fn waiting_reader_wakes_on_append() {
        let queue = Arc::new(GossipQueue::new());
        let mut cursor = queue.cursor_front();
        assert!(queue.peek(&mut cursor).is_none());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_entry(&cursor).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        push(&queue, 9);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.peek(&mut cursor).unwrap().tx()[0], 9);
    }
}
