use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use halyard_mempool::{MempoolConfig, TxChecker, TxInfo, TxKey, TxMempool, TxPool};
use proptest::prelude::*;

/// Priority is the first byte.
struct FirstByte;

impl TxChecker for FirstByte {
    fn check(&self, tx: &[u8]) -> Result<i64, String> {
        Ok(tx.first().map_or(0, |b| i64::from(*b)))
    }
}

#[derive(Clone, Debug)]
enum Op {
    Submit(Vec<u8>),
    Remove(usize),
    Commit(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::collection::vec(any::<u8>(), 1..16).prop_map(Op::Submit),
        1 => any::<usize>().prop_map(Op::Remove),
        1 => any::<usize>().prop_map(Op::Commit),
    ]
}

fn pool(size: usize, max_txs_bytes: usize) -> TxMempool {
    let config = MempoolConfig {
        size,
        max_txs_bytes,
        ..Default::default()
    };
    TxMempool::new(config, Arc::new(FirstByte), 1)
}

proptest! {
    #[test]
    fn pool_stays_within_limits_and_queue_matches(
        size in 1usize..8,
        max_txs_bytes in 16usize..96,
        ops in proptest::collection::vec(op(), 1..60),
    ) {
        let pool = pool(size, max_txs_bytes);
        let mut submitted: Vec<Bytes> = Vec::new();
        let mut height = 1;

        for op in ops {
            match op {
                Op::Submit(data) => {
                    let tx = Bytes::from(data);
                    let _ = pool.check_tx(tx.clone(), TxInfo::local());
                    submitted.push(tx);
                }
                Op::Remove(i) if !submitted.is_empty() => {
                    let tx = &submitted[i % submitted.len()];
                    pool.remove_tx(&TxKey::of(tx));
                }
                Op::Commit(i) if !submitted.is_empty() => {
                    height += 1;
                    let tx = submitted[i % submitted.len()].clone();
                    pool.update(height, &[tx]);
                }
                _ => {}
            }

            prop_assert!(pool.size() <= size);
            prop_assert!(pool.size_bytes() <= max_txs_bytes);
            prop_assert_eq!(pool.gossip_queue().len(), pool.size());
        }

        // The gossip queue walks exactly the pooled txs, oldest first.
        let queue = pool.gossip_queue();
        let mut cursor = queue.cursor_front();
        let mut seqs = Vec::new();
        let mut keys = HashSet::new();
        let mut bytes = 0;
        while let Some(entry) = queue.peek(&mut cursor) {
            prop_assert!(pool.has_tx(&entry.key()));
            seqs.push(entry.seq());
            keys.insert(entry.key());
            bytes += entry.size();
            cursor.advance(&entry);
        }
        prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(keys.len(), pool.size());
        prop_assert_eq!(bytes, pool.size_bytes());
    }

    #[test]
    fn snapshot_is_priority_ordered_and_bounded(
        txs in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..12), 0..40),
        max_bytes in 0usize..200,
    ) {
        let pool = pool(1000, 1 << 20);
        for tx in txs {
            let _ = pool.check_tx(Bytes::from(tx), TxInfo::local());
        }

        let snapshot = pool.priority_snapshot(max_bytes);
        let total: usize = snapshot.iter().map(|e| e.size()).sum();
        prop_assert!(total <= max_bytes);
        for pair in snapshot.windows(2) {
            prop_assert!(
                pair[0].priority() > pair[1].priority()
                    || (pair[0].priority() == pair[1].priority() && pair[0].seq() < pair[1].seq())
            );
        }
    }
}
