//! Transaction pool and peer-to-peer transaction gossip.
//!
//! The [`MempoolReactor`] plugs into the peer switch and keeps every
//! connected peer supplied with the pool's transactions, while admitting
//! the transactions peers send back. The pool itself is reached only
//! through the [`TxPool`] trait; [`TxMempool`] is the in-memory
//! implementation the node uses.

pub mod cache;
pub mod config;
pub mod error;
pub mod gossip_queue;
pub mod ids;
pub mod pool;
pub mod reactor;
pub mod tx;

pub use config::MempoolConfig;
pub use error::MempoolError;
pub use gossip_queue::{Cursor, GossipQueue};
pub use ids::{MempoolIds, MAX_ACTIVE_IDS, UNKNOWN_PEER_ID};
pub use pool::{AcceptAll, PoolStats, TxChecker, TxMempool, TxPool};
pub use reactor::{MempoolReactor, PrioritySnapshot, MEMPOOL_CHANNEL, MEMPOOL_PRIORITY_CHANNEL};
pub use tx::{PoolTx, TxInfo, TxKey};
