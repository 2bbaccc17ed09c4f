//! The peer switch: owns TCP listening and dialing, builds one multiplexed
//! connection per peer, and routes channels and peer lifecycle events to
//! the registered reactors.
//!
//! A peer is disconnected when its connection fails or a reactor reports it
//! as faulty. Either way the report lands on one fault queue, drained by a
//! single task, so removal happens once and never affects other peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use halyard_network::{
    ChannelDescriptor, ConnectionError, ConnectionHandler, MConnection, NetworkError, Peer,
    PeerFault, PeerId, Reactor,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::config::P2pConfig;
use crate::shutdown::ShutdownController;
use crate::NodeError;

/// Timeout for an outbound TCP connection attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between attempts to reach a persistent peer.
const DIAL_RETRY: Duration = Duration::from_secs(2);

/// Upper bound on draining one peer's queues during shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Switch {
    config: P2pConfig,
    reactors: Vec<Arc<dyn Reactor>>,
    routes: Arc<HashMap<u8, Arc<dyn Reactor>>>,
    descriptors: Vec<ChannelDescriptor>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    faults_tx: mpsc::UnboundedSender<PeerFault>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerFault>>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: ShutdownController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Collects reactors before the switch is shared.
pub struct SwitchBuilder {
    config: P2pConfig,
    reactors: Vec<Arc<dyn Reactor>>,
    routes: HashMap<u8, Arc<dyn Reactor>>,
    descriptors: Vec<ChannelDescriptor>,
}

impl SwitchBuilder {
    pub fn new(config: P2pConfig) -> Self {
        Self {
            config,
            reactors: Vec::new(),
            routes: HashMap::new(),
            descriptors: Vec::new(),
        }
    }

    /// Register `reactor` for its channels. Channels are exclusive.
    pub fn add_reactor(mut self, reactor: Arc<dyn Reactor>) -> Result<Self, NetworkError> {
        let channels = reactor.channels();
        for desc in &channels {
            if self.routes.contains_key(&desc.id) {
                return Err(NetworkError::DuplicateChannel(desc.id));
            }
        }
        for desc in channels {
            self.routes.insert(desc.id, reactor.clone());
            self.descriptors.push(desc);
        }
        debug!(reactor = reactor.name(), "registered reactor");
        self.reactors.push(reactor);
        Ok(self)
    }

    pub fn build(self) -> Arc<Switch> {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Arc::new(Switch {
            config: self.config,
            reactors: self.reactors,
            routes: Arc::new(self.routes),
            descriptors: self.descriptors,
            peers: RwLock::new(HashMap::new()),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
            local_addr: OnceLock::new(),
            shutdown: ShutdownController::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Switch {
    /// Bind the listener, start accepting, and begin dialing persistent
    /// peers. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let Some(faults) = self.lock_faults_rx().take() else {
            return Err(NodeError::AlreadyStarted);
        };
        let listener = TcpListener::bind(self.config.listen_socket_addr()?).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        info!(addr = %local, "p2p listener started");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().drain_faults(faults)));
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        for addr in &self.config.persistent_peers {
            tasks.push(tokio::spawn(self.clone().dial_loop(addr.clone())));
        }
        self.lock_tasks().extend(tasks);
        Ok(local)
    }

    /// Stop accepting and dialing, then drain and disconnect every peer.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        let peers: Vec<Arc<Peer>> = self.write_peers().drain().map(|(_, p)| p).collect();
        for peer in &peers {
            if timeout(FLUSH_TIMEOUT, peer.flush_stop()).await.is_err() {
                debug!(peer = %peer.id(), "flush timed out");
                peer.stop();
            }
            self.notify_removed(peer, "switch stopping");
        }
        info!(peers = peers.len(), "switch stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn peer_count(&self) -> usize {
        self.read_peers().len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.read_peers().values().cloned().collect()
    }

    pub fn has_peer(&self, id: &PeerId) -> bool {
        self.read_peers().contains_key(id)
    }

    /// Dial `addr` once and add the resulting peer.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Peer>, NetworkError> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("dial {addr} timed out")))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("dial {addr}: {e}")))?;
        self.add_stream(stream, PeerId::new(addr), true)
    }

    /// Wrap `stream` in a connection and peer, and hand it to every
    /// reactor. Refused when the switch is stopping, full, or already
    /// connected to `id`, or when a reactor refuses it.
    pub fn add_stream(
        &self,
        stream: TcpStream,
        id: PeerId,
        outbound: bool,
    ) -> Result<Arc<Peer>, NetworkError> {
        if self.shutdown.is_shutdown() {
            return Err(refused(&id, "switch is stopping"));
        }
        if let Err(e) = stream.set_nodelay(true) {
            trace!(peer = %id, error = %e, "cannot set TCP_NODELAY");
        }

        let mut peers = self.write_peers();
        if peers.len() >= self.config.max_peers {
            return Err(refused(&id, "max peers reached"));
        }
        if peers.contains_key(&id) {
            return Err(refused(&id, "already connected"));
        }

        let handler = Arc::new(SwitchHandler {
            id: id.clone(),
            routes: self.routes.clone(),
            faults: self.faults_tx.clone(),
            peer: OnceLock::new(),
        });
        let conn = MConnection::new(
            stream,
            self.descriptors.clone(),
            handler.clone(),
            self.config.connection.clone(),
        )?;
        let peer = Arc::new(Peer::new(id.clone(), outbound, conn, self.faults_tx.clone()));
        let _ = handler.peer.set(Arc::downgrade(&peer));
        if self.config.standalone {
            peer.set_height(0);
        }

        for (i, reactor) in self.reactors.iter().enumerate() {
            if let Err(e) = reactor.init_peer(&peer) {
                for earlier in &self.reactors[..i] {
                    earlier.remove_peer(&peer, "refused by another reactor");
                }
                peer.stop();
                return Err(e);
            }
        }
        if let Err(e) = peer.start() {
            for reactor in &self.reactors {
                reactor.remove_peer(&peer, "failed to start");
            }
            return Err(e.into());
        }

        peers.insert(id.clone(), peer.clone());
        drop(peers);
        for reactor in &self.reactors {
            reactor.add_peer(peer.clone());
        }
        info!(peer = %id, outbound, "peer added");
        Ok(peer)
    }

    /// Disconnect `id` and tell every reactor. No-op if it is already
    /// gone.
    pub fn stop_peer(&self, id: &PeerId, reason: &str) -> bool {
        let Some(peer) = self.write_peers().remove(id) else {
            return false;
        };
        peer.stop();
        self.notify_removed(&peer, reason);
        true
    }

    fn notify_removed(&self, peer: &Arc<Peer>, reason: &str) {
        for reactor in &self.reactors {
            reactor.remove_peer(peer, reason);
        }
        info!(peer = %peer.id(), reason, "peer removed");
    }

    async fn drain_faults(self: Arc<Self>, mut faults: mpsc::UnboundedReceiver<PeerFault>) {
        while let Some(fault) = faults.recv().await {
            if self.stop_peer(&fault.peer, &fault.reason) {
                warn!(peer = %fault.peer, reason = %fault.reason, "stopped faulty peer");
            } else {
                trace!(peer = %fault.peer, "fault for a peer already removed");
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = PeerId::new(addr.to_string());
                        if let Err(e) = self.add_stream(stream, id, false) {
                            warn!(peer = %addr, error = %e, "refused inbound peer");
                        }
                    }
                    Err(e) => warn!(error = %e, "p2p accept error"),
                },
            }
        }
        debug!("p2p listener stopped");
    }

    /// Keep a persistent peer connected.
    async fn dial_loop(self: Arc<Self>, addr: String) {
        let id = PeerId::new(addr.as_str());
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if !self.has_peer(&id) {
                match self.dial(&addr).await {
                    Ok(_) => {}
                    Err(NetworkError::ConnectionFailed(reason)) => {
                        debug!(peer = %addr, reason, "persistent peer unreachable");
                    }
                    Err(e) => warn!(peer = %addr, error = %e, "persistent peer refused"),
                }
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                () = sleep(DIAL_RETRY) => {}
            }
        }
    }

    fn read_peers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_peers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_faults_rx(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<PeerFault>>> {
        self.faults_rx.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn refused(id: &PeerId, reason: &str) -> NetworkError {
    NetworkError::PeerRefused {
        peer: id.to_string(),
        reason: reason.to_string(),
    }
}

/// Per-connection callbacks: routes messages by channel and turns
/// connection errors into fault reports.
struct SwitchHandler {
    id: PeerId,
    routes: Arc<HashMap<u8, Arc<dyn Reactor>>>,
    faults: mpsc::UnboundedSender<PeerFault>,
    peer: OnceLock<Weak<Peer>>,
}

impl ConnectionHandler for SwitchHandler {
    fn on_receive(&self, channel_id: u8, msg: Bytes) {
        let Some(peer) = self.peer.get().and_then(Weak::upgrade) else {
            return;
        };
        match self.routes.get(&channel_id) {
            Some(reactor) => reactor.receive(channel_id, &peer, msg),
            None => trace!(peer = %self.id, channel = channel_id, "no reactor for channel"),
        }
    }

    fn on_error(&self, err: ConnectionError) {
        let _ = self.faults.send(PeerFault {
            peer: self.id.clone(),
            reason: err.to_string(),
        });
    }
}
