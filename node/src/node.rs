//! Node wiring: the transaction pool, its gossip reactor and the switch.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use halyard_mempool::{AcceptAll, MempoolReactor, TxChecker, TxInfo, TxKey, TxMempool, TxPool};
use halyard_network::{NetworkError, PeerId};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;
use crate::switch::{Switch, SwitchBuilder};
use crate::NodeError;

/// Height the pool starts at. No consensus engine advances it.
const GENESIS_HEIGHT: i64 = 0;

pub struct Node {
    config: NodeConfig,
    pool: Arc<TxMempool>,
    reactor: Arc<MempoolReactor>,
    switch: Arc<Switch>,
    metrics: Option<NodeMetrics>,
}

impl Node {
    /// A node whose pool accepts every transaction.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        Self::with_checker(config, Arc::new(AcceptAll))
    }

    pub fn with_checker(
        config: NodeConfig,
        checker: Arc<dyn TxChecker>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let pool = Arc::new(TxMempool::new(config.mempool.clone(), checker, GENESIS_HEIGHT));
        let reactor = Arc::new(MempoolReactor::new(config.mempool.clone(), pool.clone()));
        let switch = SwitchBuilder::new(config.p2p.clone())
            .add_reactor(reactor.clone())?
            .build();
        let metrics = if config.metrics {
            Some(NodeMetrics::new()?)
        } else {
            None
        };

        Ok(Self {
            config,
            pool,
            reactor,
            switch,
            metrics,
        })
    }

    /// Start gossiping and open the p2p listener. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        self.reactor.start();
        let addr = self.switch.start().await?;
        info!(
            addr = %addr,
            peers = self.config.p2p.persistent_peers.len(),
            broadcast = self.config.mempool.broadcast,
            "node started"
        );
        Ok(addr)
    }

    pub async fn stop(&self) {
        self.reactor.stop();
        self.switch.stop().await;
        info!("node stopped");
    }

    /// Admit a transaction submitted to this node directly.
    pub fn submit_local_tx(&self, tx: Bytes) -> Result<TxKey, NodeError> {
        let key = TxKey::of(&tx);
        if let Some(metrics) = &self.metrics {
            metrics.local_tx_bytes.observe(tx.len() as f64);
        }
        self.pool.check_tx(tx, TxInfo::local())?;
        debug!(tx = %key, "local tx admitted");
        Ok(key)
    }

    /// Disconnect a peer by id.
    pub fn disconnect(&self, id: &PeerId) -> Result<(), NodeError> {
        if self.switch.stop_peer(id, "disconnect requested") {
            Ok(())
        } else {
            Err(NetworkError::PeerNotFound(id.to_string()).into())
        }
    }

    /// Refresh and render metrics, if enabled.
    pub fn metrics_text(&self) -> Result<Option<String>, NodeError> {
        let Some(metrics) = &self.metrics else {
            return Ok(None);
        };
        metrics
            .peer_count
            .set(i64::try_from(self.switch.peer_count()).unwrap_or(i64::MAX));
        metrics.observe_pool(self.pool.size(), self.pool.size_bytes(), self.pool.stats());
        metrics.encode().map(Some)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<TxMempool> {
        &self.pool
    }

    pub fn reactor(&self) -> &Arc<MempoolReactor> {
        &self.reactor
    }

    pub fn switch(&self) -> &Arc<Switch> {
        &self.switch
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.switch.local_addr()
    }
}
