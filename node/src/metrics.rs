//! Prometheus metrics for the node.
//!
//! [`NodeMetrics`] owns a dedicated [`Registry`]. The pool counters are
//! cumulative on the pool side, so [`NodeMetrics::observe_pool`] advances
//! each Prometheus counter by whatever it is missing.

use halyard_mempool::PoolStats;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};

use crate::NodeError;

pub struct NodeMetrics {
    pub registry: Registry,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Currently connected peers.
    pub peer_count: IntGauge,
    /// Transactions in the pool.
    pub mempool_size: IntGauge,
    /// Bytes held by the pool's transactions.
    pub mempool_bytes: IntGauge,

    // ── Counters ────────────────────────────────────────────────────────
    pub txs_admitted: IntCounter,
    pub txs_rejected: IntCounter,
    pub txs_evicted: IntCounter,
    pub txs_expired: IntCounter,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Size of locally submitted transactions.
    pub local_tx_bytes: Histogram,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, NodeError> {
        let registry = Registry::new();

        let peer_count = register_int_gauge_with_registry!(
            Opts::new("halyard_peer_count", "Currently connected peers"),
            registry
        )?;
        let mempool_size = register_int_gauge_with_registry!(
            Opts::new("halyard_mempool_size", "Transactions in the mempool"),
            registry
        )?;
        let mempool_bytes = register_int_gauge_with_registry!(
            Opts::new("halyard_mempool_bytes", "Total size of mempool transactions"),
            registry
        )?;

        let txs_admitted = register_int_counter_with_registry!(
            Opts::new(
                "halyard_mempool_txs_admitted_total",
                "Transactions admitted to the mempool"
            ),
            registry
        )?;
        let txs_rejected = register_int_counter_with_registry!(
            Opts::new(
                "halyard_mempool_txs_rejected_total",
                "Transactions rejected by the application check"
            ),
            registry
        )?;
        let txs_evicted = register_int_counter_with_registry!(
            Opts::new(
                "halyard_mempool_txs_evicted_total",
                "Transactions evicted to make room for higher priority ones"
            ),
            registry
        )?;
        let txs_expired = register_int_counter_with_registry!(
            Opts::new(
                "halyard_mempool_txs_expired_total",
                "Transactions purged after outliving their TTL"
            ),
            registry
        )?;

        // 16 bytes to 1 MiB.
        let local_tx_bytes = register_histogram_with_registry!(
            HistogramOpts::new("halyard_local_tx_bytes", "Size of locally submitted txs")
                .buckets(prometheus::exponential_buckets(16.0, 4.0, 9)?),
            registry
        )?;

        Ok(Self {
            registry,
            peer_count,
            mempool_size,
            mempool_bytes,
            txs_admitted,
            txs_rejected,
            txs_evicted,
            txs_expired,
            local_tx_bytes,
        })
    }

    /// Copy the pool's gauges and cumulative counters.
    pub fn observe_pool(&self, size: usize, size_bytes: usize, stats: PoolStats) {
        self.mempool_size.set(gauge(size));
        self.mempool_bytes.set(gauge(size_bytes));
        catch_up(&self.txs_admitted, stats.admitted);
        catch_up(&self.txs_rejected, stats.rejected);
        catch_up(&self.txs_evicted, stats.evicted);
        catch_up(&self.txs_expired, stats.expired);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, NodeError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| NodeError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

fn gauge(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn catch_up(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}
