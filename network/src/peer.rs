//! A connected peer: identity, liveness and reported height around one
//! multiplexed connection.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{info_span, warn};

use crate::connection::{ConnectionStatus, MConnection};
use crate::ConnectionError;

/// Sentinel meaning the peer has not reported a height yet.
const UNKNOWN_HEIGHT: i64 = i64::MIN;

/// Stable identity of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Why a peer should be disconnected, as reported to whoever owns it.
#[derive(Clone, Debug)]
pub struct PeerFault {
    pub peer: PeerId,
    pub reason: String,
}

pub struct Peer {
    id: PeerId,
    outbound: bool,
    conn: MConnection,
    height: AtomicI64,
    quit: watch::Sender<bool>,
    faults: mpsc::UnboundedSender<PeerFault>,
}

impl Peer {
    /// `faults` receives this peer's fatal reports; the owner is expected
    /// to stop and remove it.
    pub fn new(
        id: PeerId,
        outbound: bool,
        conn: MConnection,
        faults: mpsc::UnboundedSender<PeerFault>,
    ) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            id,
            outbound,
            conn,
            height: AtomicI64::new(UNKNOWN_HEIGHT),
            quit,
            faults,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn start(&self) -> Result<(), ConnectionError> {
        let _span = info_span!("peer", peer = %self.id).entered();
        self.conn.start()
    }

    /// Queue `msg` on `channel_id`, waiting for room.
    pub async fn send(&self, channel_id: u8, msg: Bytes) -> bool {
        self.conn.send(channel_id, msg).await
    }

    pub fn try_send(&self, channel_id: u8, msg: Bytes) -> bool {
        self.conn.try_send(channel_id, msg)
    }

    pub fn is_running(&self) -> bool {
        self.conn.is_running() && !*self.quit.borrow()
    }

    /// Completes when the peer is stopped or its connection terminates.
    pub async fn quit(&self) {
        let mut quit = self.quit.subscribe();
        tokio::select! {
            _ = quit.wait_for(|q| *q) => {}
            () = self.conn.terminated() => {}
        }
    }

    /// Last height reported for this peer, if any.
    pub fn height(&self) -> Option<i64> {
        match self.height.load(Ordering::Acquire) {
            UNKNOWN_HEIGHT => None,
            h => Some(h),
        }
    }

    pub fn set_height(&self, height: i64) {
        self.height.store(height, Ordering::Release);
    }

    /// Ask the owner to disconnect this peer.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let fault = PeerFault {
            peer: self.id.clone(),
            reason: reason.into(),
        };
        warn!(peer = %self.id, reason = %fault.reason, "peer reported as faulty");
        // The owner is gone only during shutdown.
        let _ = self.faults.send(fault);
    }

    /// Stop the peer and its connection immediately.
    pub fn stop(&self) {
        self.quit.send_replace(true);
        self.conn.stop();
    }

    /// Drain queued messages to the wire, then stop.
    pub async fn flush_stop(&self) {
        self.quit.send_replace(true);
        self.conn.flush_stop().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("outbound", &self.outbound)
            .field("height", &self.height())
            .field("running", &self.is_running())
            .finish()
    }
}
