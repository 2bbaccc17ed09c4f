//! End-to-end tests: real nodes talking over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use halyard_mempool::{MempoolReactor, TxKey, TxPool};
use halyard_network::{NetworkError, PeerId};
use halyard_node::{Node, NodeConfig, NodeError, P2pConfig, SwitchBuilder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(peers: Vec<String>) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.p2p.listen_addr = "127.0.0.1:0".into();
    config.p2p.persistent_peers = peers;
    config.mempool.priority_interval_ms = 100;
    config.mempool.peer_catchup_sleep_ms = 10;
    config.metrics = true;
    config
}

async fn start_node(peers: Vec<String>) -> (Node, String) {
    let node = Node::new(config(peers)).unwrap();
    let addr = node.start().await.unwrap();
    (node, addr.to_string())
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn has(node: &Node, tx: &Bytes) -> bool {
    node.pool().has_tx(&TxKey::of(tx))
}

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn txs_gossip_both_ways_between_two_nodes() {
    let (a, a_addr) = start_node(Vec::new()).await;
    let (b, _) = start_node(vec![a_addr]).await;
    eventually("connection", || a.switch().peer_count() == 1 && b.switch().peer_count() == 1)
        .await;

    let from_a = Bytes::from_static(b"tx from a");
    a.submit_local_tx(from_a.clone()).unwrap();
    eventually("tx at b", || has(&b, &from_a)).await;

    let from_b = Bytes::from_static(b"tx from b");
    b.submit_local_tx(from_b.clone()).unwrap();
    eventually("tx at a", || has(&a, &from_b)).await;

    // Each tx crossed once; the echo was suppressed.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(a.pool().stats().admitted, 2);
    assert_eq!(b.pool().stats().admitted, 2);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn txs_are_relayed_along_a_chain() {
    let (a, a_addr) = start_node(Vec::new()).await;
    let (b, b_addr) = start_node(vec![a_addr]).await;
    let (c, _) = start_node(vec![b_addr]).await;
    eventually("chain", || b.switch().peer_count() == 2).await;

    let txs: Vec<Bytes> = (0..20u8).map(|n| Bytes::from(vec![n; 8])).collect();
    for tx in &txs {
        a.submit_local_tx(tx.clone()).unwrap();
    }
    eventually("all txs at c", || txs.iter().all(|tx| has(&c, tx))).await;
    assert_eq!(c.pool().size(), 20);

    for node in [&c, &b, &a] {
        node.stop().await;
    }
}

#[tokio::test]
async fn local_duplicate_is_reported() {
    let (a, _) = start_node(Vec::new()).await;
    let tx = Bytes::from_static(b"once");
    a.submit_local_tx(tx.clone()).unwrap();
    assert!(matches!(
        a.submit_local_tx(tx),
        Err(NodeError::Mempool(halyard_mempool::MempoolError::TxInCache))
    ));
    a.stop().await;
}

// ---------------------------------------------------------------------------
// Switch behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_peers_is_enforced() {
    let mut cfg = config(Vec::new());
    cfg.p2p.max_peers = 1;
    let a = Node::new(cfg).unwrap();
    let a_addr = a.start().await.unwrap().to_string();

    let (b, _) = start_node(vec![a_addr.clone()]).await;
    eventually("first peer", || a.switch().peer_count() == 1).await;

    let (c, _) = start_node(vec![a_addr]).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(a.switch().peer_count(), 1);

    for node in [&c, &b, &a] {
        node.stop().await;
    }
}

#[tokio::test]
async fn misbehaving_peer_is_dropped_without_affecting_others() {
    let (a, a_addr) = start_node(Vec::new()).await;
    let (b, _) = start_node(vec![a_addr.clone()]).await;
    eventually("honest peer", || a.switch().peer_count() == 1).await;

    let mut rogue = TcpStream::connect(&a_addr).await.unwrap();
    eventually("rogue peer", || a.switch().peer_count() == 2).await;
    // A frame announcing 4 bytes of something that is not a packet.
    rogue.write_all(&[0x04, 0xff, 0xff, 0xff, 0xff]).await.unwrap();
    eventually("rogue removed", || a.switch().peer_count() == 1).await;

    let tx = Bytes::from_static(b"still gossiping");
    a.submit_local_tx(tx.clone()).unwrap();
    eventually("tx at b", || has(&b, &tx)).await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn stopping_a_node_disconnects_its_peers() {
    let (a, a_addr) = start_node(Vec::new()).await;
    let (b, _) = start_node(vec![a_addr]).await;
    eventually("connection", || b.switch().peer_count() == 1).await;

    a.stop().await;
    assert_eq!(a.switch().peer_count(), 0);
    eventually("b notices", || b.switch().peer_count() == 0).await;
    assert_eq!(b.reactor().ids().active_count(), 0);
    b.stop().await;
}

#[tokio::test]
async fn disconnecting_an_unknown_peer_fails() {
    let (a, _) = start_node(Vec::new()).await;
    assert!(matches!(
        a.disconnect(&PeerId::new("10.0.0.1:1")),
        Err(NodeError::Network(NetworkError::PeerNotFound(_)))
    ));
    a.stop().await;
}

#[tokio::test]
async fn starting_twice_fails() {
    let (a, _) = start_node(Vec::new()).await;
    assert!(matches!(a.start().await, Err(NodeError::AlreadyStarted)));
    a.stop().await;
}

#[test]
fn overlapping_channels_are_rejected() {
    let cfg = config(Vec::new());
    let pool = Arc::new(halyard_mempool::TxMempool::new(
        cfg.mempool.clone(),
        Arc::new(halyard_mempool::AcceptAll),
        0,
    ));
    let first = Arc::new(MempoolReactor::new(cfg.mempool.clone(), pool.clone()));
    let second = Arc::new(MempoolReactor::new(cfg.mempool, pool));
    let result = SwitchBuilder::new(P2pConfig::default())
        .add_reactor(first)
        .unwrap()
        .add_reactor(second);
    assert!(matches!(result, Err(NetworkError::DuplicateChannel(_))));
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let mut cfg = config(Vec::new());
    cfg.p2p.max_peers = 0;
    assert!(matches!(Node::new(cfg), Err(NodeError::Config(_))));
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_reflect_pool_and_peers() {
    let (a, a_addr) = start_node(Vec::new()).await;
    let (b, _) = start_node(vec![a_addr]).await;
    eventually("connection", || a.switch().peer_count() == 1).await;

    a.submit_local_tx(Bytes::from_static(b"metered")).unwrap();
    let text = a.metrics_text().unwrap().unwrap();
    assert!(text.contains("halyard_peer_count 1"));
    assert!(text.contains("halyard_mempool_size 1"));
    assert!(text.contains("halyard_mempool_txs_admitted_total 1"));
    assert!(text.contains("halyard_local_tx_bytes_count 1"));

    let mut quiet = config(Vec::new());
    quiet.metrics = false;
    assert!(Node::new(quiet).unwrap().metrics_text().unwrap().is_none());

    b.stop().await;
    a.stop().await;
}
