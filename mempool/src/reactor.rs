//! Transaction gossip between peers.
//!
//! Each connected peer gets two delivery tasks when broadcasting is on:
//!
//! * **flood**: walks the pool's gossip queue in insertion order and sends
//!   every entry the peer does not have yet, one transaction per message,
//!   on [`MEMPOOL_CHANNEL`];
//! * **priority**: every time a new priority snapshot is published, sends
//!   the snapshot's entries on [`MEMPOOL_PRIORITY_CHANNEL`].
//!
//! Both paths claim an entry for the peer through the pool before sending
//! it, so a peer receives each transaction at most once no matter which
//! path gets there first. Entries that originated at a height the peer has
//! not nearly reached are withheld until it catches up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use halyard_messages::{max_txs_message_size, MempoolMessage};
use halyard_network::{ChannelDescriptor, NetworkError, Peer, Reactor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::config::MempoolConfig;
use crate::ids::MempoolIds;
use crate::pool::TxPool;
use crate::tx::{PoolTx, TxInfo, TxKey};
use crate::MempoolError;

/// Flood gossip channel.
pub const MEMPOOL_CHANNEL: u8 = 0x30;

/// Priority gossip channel. Outranks [`MEMPOOL_CHANNEL`] on the wire.
pub const MEMPOOL_PRIORITY_CHANNEL: u8 = 0x80;

const MEMPOOL_CHANNEL_PRIORITY: i32 = 5;
const MEMPOOL_PRIORITY_CHANNEL_PRIORITY: i32 = 10;

/// Top of the pool by priority at one point in time.
#[derive(Debug, Default)]
pub struct PrioritySnapshot {
    pub generation: u64,
    pub txs: Vec<Arc<PoolTx>>,
}

pub struct MempoolReactor {
    config: MempoolConfig,
    pool: Arc<dyn TxPool>,
    ids: MempoolIds,
    snapshot: watch::Sender<Arc<PrioritySnapshot>>,
    quit: watch::Sender<bool>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl MempoolReactor {
    pub fn new(config: MempoolConfig, pool: Arc<dyn TxPool>) -> Self {
        Self::with_ids(config, pool, MempoolIds::new())
    }

    pub fn with_ids(config: MempoolConfig, pool: Arc<dyn TxPool>, ids: MempoolIds) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(PrioritySnapshot::default()));
        let (quit, _) = watch::channel(false);
        Self {
            config,
            pool,
            ids,
            snapshot,
            quit,
            snapshot_task: Mutex::new(None),
        }
    }

    /// Start the snapshot task. Without broadcasting only inbound
    /// admission runs.
    pub fn start(&self) {
        if !self.config.broadcast {
            info!("tx broadcasting is disabled");
            return;
        }
        let mut task = self.snapshot_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(snapshot_loop(
            self.pool.clone(),
            self.snapshot.clone(),
            self.quit.subscribe(),
            self.config.priority_interval(),
            self.config.priority_broadcast_max_bytes,
        )));
    }

    /// Stop every gossip task. Inbound messages are still admitted.
    pub fn stop(&self) {
        self.quit.send_replace(true);
        if let Some(task) = self
            .snapshot_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.quit.borrow()
    }

    pub fn ids(&self) -> &MempoolIds {
        &self.ids
    }

    /// The most recently published priority snapshot.
    pub fn snapshot(&self) -> Arc<PrioritySnapshot> {
        self.snapshot.borrow().clone()
    }

    fn admit(&self, peer: &Peer, txs: Vec<Bytes>) {
        let info = TxInfo::from_peer(self.ids.get_for_peer(peer.id()), peer.id().clone());
        for tx in txs {
            let key = TxKey::of(&tx);
            match self.pool.check_tx(tx, info.clone()) {
                Ok(()) => trace!(peer = %peer.id(), tx = %key, "admitted tx from peer"),
                Err(MempoolError::TxInCache) => {
                    debug!(peer = %peer.id(), tx = %key, "tx already exists in cache");
                }
                Err(e) => info!(peer = %peer.id(), tx = %key, error = %e, "could not check tx"),
            }
        }
    }
}

impl Reactor for MempoolReactor {
    fn name(&self) -> &'static str {
        "mempool"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        let capacity = max_txs_message_size(self.config.max_tx_bytes);
        vec![
            ChannelDescriptor::new(MEMPOOL_CHANNEL, MEMPOOL_CHANNEL_PRIORITY)
                .with_recv_message_capacity(capacity),
            ChannelDescriptor::new(MEMPOOL_PRIORITY_CHANNEL, MEMPOOL_PRIORITY_CHANNEL_PRIORITY)
                .with_recv_message_capacity(capacity),
        ]
    }

    fn init_peer(&self, peer: &Arc<Peer>) -> Result<(), NetworkError> {
        let id = self
            .ids
            .reserve_for_peer(peer.id())
            .map_err(|e| NetworkError::PeerRefused {
                peer: peer.id().to_string(),
                reason: e.to_string(),
            })?;
        debug!(peer = %peer.id(), id, "reserved mempool id");
        Ok(())
    }

    fn add_peer(&self, peer: Arc<Peer>) {
        if !self.config.broadcast {
            return;
        }
        let gossip = PeerGossip {
            pool: self.pool.clone(),
            peer_id: self.ids.get_for_peer(peer.id()),
            peer,
            catchup: self.config.peer_catchup_sleep(),
            quit: self.quit.subscribe(),
        };
        let snapshots = self.snapshot.subscribe();
        tokio::spawn(gossip.clone().flood());
        tokio::spawn(gossip.priority(snapshots));
    }

    fn remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        self.ids.reclaim(peer.id());
        debug!(peer = %peer.id(), reason, "released mempool id");
    }

    fn receive(&self, channel_id: u8, peer: &Arc<Peer>, msg: Bytes) {
        trace!(peer = %peer.id(), channel = channel_id, bytes = msg.len(), "receive");
        let txs = match MempoolMessage::decode_txs(&msg) {
            Ok(txs) => txs,
            Err(e) => {
                error!(peer = %peer.id(), channel = channel_id, error = %e, "unknown message type");
                peer.report_fatal(format!("mempool cannot handle message: {e}"));
                return;
            }
        };
        if txs.is_empty() {
            error!(peer = %peer.id(), "received empty txs from peer");
            return;
        }
        self.admit(peer, txs);
    }
}

async fn snapshot_loop(
    pool: Arc<dyn TxPool>,
    snapshot: watch::Sender<Arc<PrioritySnapshot>>,
    mut quit: watch::Receiver<bool>,
    every: Duration,
    max_bytes: usize,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut generation = 0;
    loop {
        tokio::select! {
            biased;
            _ = quit.wait_for(|q| *q) => break,
            _ = ticker.tick() => {}
        }
        generation += 1;
        let txs = pool.priority_snapshot(max_bytes);
        debug!(generation, txs = txs.len(), "published priority snapshot");
        snapshot.send_replace(Arc::new(PrioritySnapshot { generation, txs }));
    }
}

/// Everything one peer's delivery tasks need.
#[derive(Clone)]
struct PeerGossip {
    pool: Arc<dyn TxPool>,
    peer: Arc<Peer>,
    peer_id: u16,
    catchup: Duration,
    quit: watch::Receiver<bool>,
}

impl PeerGossip {
    async fn flood(mut self) {
        let pool = self.pool.clone();
        let queue = pool.gossip_queue();
        let mut cursor = queue.cursor_front();
        loop {
            if self.stopped() {
                return;
            }
            let Some(entry) = queue.peek(&mut cursor) else {
                tokio::select! {
                    () = queue.wait_for_entry(&cursor) => continue,
                    () = self.peer.quit() => return,
                    _ = self.quit.wait_for(|q| *q) => return,
                }
            };

            if !self.ready_for(&entry) {
                if !self.backoff().await {
                    return;
                }
                continue;
            }
            if !self.deliver(&entry, MEMPOOL_CHANNEL).await {
                return;
            }
            cursor.advance(&entry);
        }
    }

    async fn priority(mut self, mut snapshots: watch::Receiver<Arc<PrioritySnapshot>>) {
        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = self.peer.quit() => return,
                _ = self.quit.wait_for(|q| *q) => return,
            }
            let snapshot = snapshots.borrow_and_update().clone();

            while self.peer.height().is_none() {
                if !self.backoff().await {
                    return;
                }
            }
            for entry in &snapshot.txs {
                if self.stopped() {
                    return;
                }
                if !self.pool.has_tx(&entry.key()) {
                    continue;
                }
                if !self.ready_for(entry) {
                    // Skip rather than stall the whole snapshot.
                    if !self.backoff().await {
                        return;
                    }
                    continue;
                }
                if !self.deliver(entry, MEMPOOL_PRIORITY_CHANNEL).await {
                    return;
                }
            }
            trace!(peer = %self.peer.id(), generation = snapshot.generation, "priority round done");
        }
    }

    fn stopped(&self) -> bool {
        *self.quit.borrow() || !self.peer.is_running()
    }

    /// The peer has a height and lags the entry by at most one block.
    fn ready_for(&self, entry: &PoolTx) -> bool {
        self.peer
            .height()
            .is_some_and(|height| height >= entry.height().saturating_sub(1))
    }

    /// Sleep one catch-up interval. False if the peer or reactor quit
    /// meanwhile.
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            () = sleep(self.catchup) => true,
            () = self.peer.quit() => false,
            _ = self.quit.wait_for(|q| *q) => false,
        }
    }

    /// Send `entry` unless the peer has it or it left the pool.
    /// False once the peer can no longer be sent to.
    async fn deliver(&self, entry: &PoolTx, channel: u8) -> bool {
        if entry.has_peer(self.peer_id) || !self.pool.has_tx(&entry.key()) {
            return true;
        }
        if !self.pool.mark_delivered_to(entry, self.peer_id) {
            return true;
        }
        let msg = MempoolMessage::encode_single(entry.tx().clone());
        if !self.peer.send(channel, msg).await {
            debug!(peer = %self.peer.id(), tx = %entry.key(), "send failed, peer is going away");
            return false;
        }
        trace!(peer = %self.peer.id(), channel, tx = %entry.key(), "sent tx");
        true
    }
}
