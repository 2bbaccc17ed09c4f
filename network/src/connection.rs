//! Multiplexed connection over one duplex byte stream.
//!
//! An [`MConnection`] exposes a fixed set of logical channels. Each channel
//! has a bounded send queue; a single writer task drains the queues into
//! length-delimited packets, favouring the channel with the least recent
//! traffic relative to its priority, and a single reader task reassembles
//! inbound fragments and hands whole messages to the
//! [`ConnectionHandler`].
//!
//! Both directions are paced by a [`FlowMonitor`]. The writer keeps the
//! link alive with periodic pings and fails the connection when a pong
//! does not come back in time. Any fatal condition moves the connection to
//! [`ConnState::Errored`] and is reported exactly once.

mod channel;
mod codec;
mod config;

pub use channel::{ChannelDescriptor, ChannelStatus, DEFAULT_RECV_MESSAGE_CAPACITY};
pub use codec::{frame_len, PacketCodec};
pub use config::MConnConfig;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use halyard_messages::p2p::packet::Sum;
use halyard_messages::Packet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn, Instrument};

use crate::flow_rate::{FlowMonitor, MonitorStatus};
use crate::{ConnectionError, NetworkError};

use channel::{send_pair, ChannelHandle, RecvChannel, SendChannel};

/// How often the writer ages each channel's recent-traffic counter.
const STATS_INTERVAL: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Running,
    Stopped,
    Errored,
}

impl ConnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

/// Receives what a connection delivers.
///
/// Called from the connection's reader and writer tasks; implementations
/// must not block.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete message arrived on `channel_id`.
    fn on_receive(&self, channel_id: u8, msg: Bytes);

    /// The connection failed. Called at most once.
    fn on_error(&self, err: ConnectionError);
}

#[derive(Clone, Debug)]
pub struct ConnectionStatus {
    pub duration: Duration,
    pub state: ConnState,
    pub send_monitor: MonitorStatus,
    pub recv_monitor: MonitorStatus,
    pub channels: Vec<ChannelStatus>,
}

/// State shared by the connection handle and its tasks.
struct Shared {
    config: MConnConfig,
    /// Encoded size of a maximal message packet.
    max_packet_size: usize,
    state: watch::Sender<ConnState>,
    handler: Arc<dyn ConnectionHandler>,
    send_monitor: FlowMonitor,
    recv_monitor: FlowMonitor,
    send_ready: Notify,
    /// Held around every handler callback, so nothing is delivered once
    /// `on_error` has run.
    callbacks: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        *self.state.borrow() == ConnState::Running
    }

    /// Move from `from` to `to`. Returns whether this call made the change.
    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Stopped`. Returns whether this call made the change.
    fn stop(&self) -> bool {
        let stopped = self.transition(ConnState::Running, ConnState::Stopped)
            || self.transition(ConnState::Created, ConnState::Stopped);
        if stopped {
            debug!("connection stopped");
            self.send_monitor.done();
            self.recv_monitor.done();
        }
        stopped
    }

    fn stop_for_error(&self, err: ConnectionError) {
        {
            let _callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if !self.transition(ConnState::Running, ConnState::Errored) {
                return;
            }
            warn!(error = %err, "connection failed");
            self.send_monitor.done();
            self.recv_monitor.done();
            self.handler.on_error(err);
        }
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }

    /// Bytes one writer batch may put on the wire.
    fn send_chunk(&self) -> usize {
        self.config.max_send_batch_packets * self.max_packet_size
    }
}

/// Everything the tasks take ownership of on start.
struct Parts {
    reader: BoxedReader,
    writer: BoxedWriter,
    send_channels: Vec<SendChannel>,
    recv_channels: HashMap<u8, RecvChannel>,
    flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

pub struct MConnection {
    shared: Arc<Shared>,
    /// Registration order, for status reporting.
    order: Vec<u8>,
    channels: HashMap<u8, ChannelHandle>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    parts: Mutex<Option<Parts>>,
}

impl MConnection {
    /// Wrap `stream` with the given channels. Nothing runs until [`start`].
    ///
    /// [`start`]: MConnection::start
    pub fn new<S>(
        stream: S,
        descriptors: Vec<ChannelDescriptor>,
        handler: Arc<dyn ConnectionHandler>,
        config: MConnConfig,
    ) -> Result<Self, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let mut order = Vec::with_capacity(descriptors.len());
        let mut channels = HashMap::with_capacity(descriptors.len());
        let mut send_channels = Vec::with_capacity(descriptors.len());
        let mut recv_channels = HashMap::with_capacity(descriptors.len());
        for desc in &descriptors {
            if channels.contains_key(&desc.id) {
                return Err(NetworkError::DuplicateChannel(desc.id));
            }
            let (handle, sender) = send_pair(desc);
            order.push(desc.id);
            channels.insert(desc.id, handle);
            send_channels.push(sender);
            recv_channels.insert(desc.id, RecvChannel::new(desc));
        }

        let (reader, writer) = tokio::io::split(stream);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(ConnState::Created);

        Ok(Self {
            shared: Arc::new(Shared {
                max_packet_size: config.max_packet_size(),
                config,
                state,
                handler,
                send_monitor: FlowMonitor::new(),
                recv_monitor: FlowMonitor::new(),
                send_ready: Notify::new(),
                callbacks: Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
            order,
            channels,
            flush_tx,
            parts: Mutex::new(Some(Parts {
                reader: Box::new(reader),
                writer: Box::new(writer),
                send_channels,
                recv_channels,
                flush_rx,
            })),
        })
    }

    /// Spawn the reader and writer tasks. Must be called inside a runtime.
    pub fn start(&self) -> Result<(), ConnectionError> {
        let parts = {
            let mut parts = self.parts.lock().unwrap_or_else(|e| e.into_inner());
            if *self.shared.state.borrow() != ConnState::Created {
                return Err(ConnectionError::AlreadyStarted);
            }
            parts.take().ok_or(ConnectionError::AlreadyStarted)?
        };
        self.shared.transition(ConnState::Created, ConnState::Running);

        let (pong_req_tx, pong_req_rx) = mpsc::channel(1);
        let (pong_tx, pong_rx) = mpsc::channel(1);

        let max_frame = self.shared.max_packet_size;
        let writer = Writer {
            shared: self.shared.clone(),
            out: FramedWrite::new(parts.writer, PacketCodec::new(max_frame)),
            channels: parts.send_channels,
            next_start: 0,
            last_flush: Instant::now(),
            dirty: false,
        };
        let reader = Reader {
            shared: self.shared.clone(),
            input: FramedRead::with_capacity(
                parts.reader,
                PacketCodec::new(max_frame),
                max_frame.max(8 * 1024),
            ),
            channels: parts.recv_channels,
            pong_req_tx,
            pong_tx,
        };

        let span = tracing::Span::current();
        let writer_task = tokio::spawn(
            writer
                .run(parts.flush_rx, pong_req_rx, pong_rx)
                .instrument(span.clone()),
        );
        let reader_task = tokio::spawn(reader.run().instrument(span));
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([writer_task, reader_task]);

        // A fatal error in a freshly spawned task may have beaten us here.
        if !self.shared.is_running() {
            self.shared.abort_tasks();
        }
        debug!(channels = self.order.len(), "connection started");
        Ok(())
    }

    /// Stop immediately. Queued data may be lost.
    ///
    /// Returns whether this call stopped the connection.
    pub fn stop(&self) -> bool {
        let stopped = self.shared.stop();
        self.shared.abort_tasks();
        stopped
    }

    /// Write out everything queued, flush, then stop.
    ///
    /// The connection is `Stopped` before the stream is closed, so the
    /// remote hanging up afterwards is not reported as an error.
    pub async fn flush_stop(&self) {
        if self.shared.is_running() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self.flush_tx.send(reply_tx).await.is_ok() {
                // Dropped without a reply if the writer fails or is aborted.
                let _ = reply_rx.await;
            }
        }
        self.stop();
    }

    /// Queue `msg` on `channel_id`, waiting for room.
    ///
    /// Returns false if the channel is unknown or the connection is not
    /// running (or stops while waiting).
    pub async fn send(&self, channel_id: u8, msg: Bytes) -> bool {
        if !self.shared.is_running() {
            return false;
        }
        let Some(channel) = self.channels.get(&channel_id) else {
            debug!(channel = channel_id, "send on unknown channel");
            return false;
        };
        let mut state = self.shared.state.subscribe();
        let queued = tokio::select! {
            res = channel.tx.send(msg) => res.is_ok(),
            _ = state.wait_for(|s| s.is_terminal()) => false,
        };
        if queued {
            self.shared.send_ready.notify_one();
        }
        queued
    }

    /// Queue `msg` only if there is room right now.
    pub fn try_send(&self, channel_id: u8, msg: Bytes) -> bool {
        if !self.shared.is_running() {
            return false;
        }
        let Some(channel) = self.channels.get(&channel_id) else {
            debug!(channel = channel_id, "try_send on unknown channel");
            return false;
        };
        let queued = channel.tx.try_send(msg).is_ok();
        if queued {
            self.shared.send_ready.notify_one();
        }
        queued
    }

    /// Whether `channel_id` has room in its send queue.
    pub fn can_send(&self, channel_id: u8) -> bool {
        self.shared.is_running()
            && self
                .channels
                .get(&channel_id)
                .is_some_and(|channel| channel.tx.capacity() > 0)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.borrow()
    }

    /// Completes once the connection is stopped or errored.
    pub async fn terminated(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        let send_monitor = self.shared.send_monitor.status();
        ConnectionStatus {
            duration: send_monitor.start.elapsed(),
            state: self.state(),
            send_monitor,
            recv_monitor: self.shared.recv_monitor.status(),
            channels: self
                .order
                .iter()
                .filter_map(|id| self.channels.get(id))
                .map(ChannelHandle::status)
                .collect(),
        }
    }

    /// Highest outbound rate the pacing can let through, in bytes per second.
    pub fn send_rate_ceiling(&self) -> i64 {
        self.shared
            .send_monitor
            .ceiling(self.shared.config.send_rate, self.shared.send_chunk())
    }

    /// Highest inbound rate the pacing can let through, in bytes per second.
    pub fn recv_rate_ceiling(&self) -> i64 {
        self.shared
            .recv_monitor
            .ceiling(self.shared.config.recv_rate, self.shared.max_packet_size)
    }

    pub fn config(&self) -> &MConnConfig {
        &self.shared.config
    }
}

impl Drop for MConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Writer ──────────────────────────────────────────────────────────────

struct Writer {
    shared: Arc<Shared>,
    out: FramedWrite<BoxedWriter, PacketCodec>,
    channels: Vec<SendChannel>,
    /// Round-robin start for tie breaking.
    next_start: usize,
    last_flush: Instant,
    dirty: bool,
}

impl Writer {
    async fn run(
        mut self,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
        mut pong_req_rx: mpsc::Receiver<()>,
        mut pong_rx: mpsc::Receiver<()>,
    ) {
        let config = self.shared.config.clone();
        let mut ping = interval_at(Instant::now() + config.ping_interval(), config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        let pong_deadline = sleep(config.pong_timeout());
        tokio::pin!(pong_deadline);
        let mut awaiting_pong = false;
        let mut pending = true;

        loop {
            let wait = if pending {
                self.shared
                    .send_monitor
                    .delay(config.send_rate, self.shared.send_chunk())
            } else {
                Duration::ZERO
            };
            if !wait.is_zero() {
                if let Err(e) = self.flush().await {
                    self.shared.stop_for_error(e);
                    return;
                }
            }

            let result = tokio::select! {
                biased;

                Some(reply) = flush_rx.recv() => {
                    match self.drain().await {
                        Ok(()) => {
                            let _ = reply.send(());
                            return;
                        }
                        Err(e) => Err(e),
                    }
                }
                Some(()) = pong_req_rx.recv() => {
                    trace!("sending pong");
                    self.write_control(Packet::pong()).await
                }
                Some(()) = pong_rx.recv() => {
                    awaiting_pong = false;
                    Ok(())
                }
                () = &mut pong_deadline, if awaiting_pong => Err(ConnectionError::PongTimeout),
                _ = ping.tick() => {
                    trace!("sending ping");
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout());
                    self.write_control(Packet::ping()).await
                }
                _ = stats.tick() => {
                    for channel in &self.channels {
                        channel.decay();
                    }
                    Ok(())
                }
                () = sleep(wait), if pending => {
                    self.send_some().await.map(|more| pending = more)
                }
                () = self.shared.send_ready.notified(), if !pending => {
                    pending = true;
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.shared.stop_for_error(e);
                return;
            }
        }
    }

    /// Send one batch. Returns whether more data may be pending.
    async fn send_some(&mut self) -> Result<bool, ConnectionError> {
        let shared = self.shared.clone();
        let config = &shared.config;
        if !shared
            .send_monitor
            .delay(config.send_rate, shared.send_chunk())
            .is_zero()
        {
            return Ok(true);
        }
        let Some(idx) = self.pick_channel() else {
            self.flush().await?;
            return Ok(false);
        };
        self.write_batch(idx).await?;
        if self.last_flush.elapsed() >= config.flush_throttle() {
            self.flush().await?;
        }
        Ok(true)
    }

    /// Write out every queue under the rate limit, flush, stop and close
    /// the stream.
    async fn drain(&mut self) -> Result<(), ConnectionError> {
        let rate = self.shared.config.send_rate;
        let chunk = self.shared.send_chunk();
        loop {
            let wait = self.shared.send_monitor.delay(rate, chunk);
            if !wait.is_zero() {
                self.flush().await?;
                sleep(wait).await;
                continue;
            }
            let Some(idx) = self.pick_channel() else {
                break;
            };
            self.write_batch(idx).await?;
        }
        self.flush().await?;
        self.shared.stop();
        self.out.close().await?;
        debug!("connection flushed");
        Ok(())
    }

    /// The pending channel with the lowest `recently_sent / priority`.
    fn pick_channel(&mut self) -> Option<usize> {
        let n = self.channels.len();
        let mut best: Option<(usize, f64)> = None;
        for k in 0..n {
            let idx = (self.next_start + k) % n;
            let channel = &mut self.channels[idx];
            if !channel.is_pending() {
                continue;
            }
            let ratio = channel.ratio();
            if best.map_or(true, |(_, lowest)| ratio < lowest) {
                best = Some((idx, ratio));
            }
        }
        let (idx, _) = best?;
        self.next_start = (idx + 1) % n;
        Some(idx)
    }

    async fn write_batch(&mut self, idx: usize) -> Result<(), ConnectionError> {
        let max_payload = self.shared.config.max_packet_msg_payload_size;
        for _ in 0..self.shared.config.max_send_batch_packets {
            let Some(packet) = self.channels[idx].next_packet(max_payload) else {
                break;
            };
            let n = frame_len(&packet);
            self.out.feed(packet).await?;
            self.dirty = true;
            self.shared.send_monitor.update(n);
            self.channels[idx].record_sent(n);
        }
        Ok(())
    }

    async fn write_control(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let n = frame_len(&packet);
        self.out.feed(packet).await?;
        self.shared.send_monitor.update(n);
        self.dirty = true;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.dirty {
            self.out.flush().await?;
            self.dirty = false;
        }
        self.last_flush = Instant::now();
        Ok(())
    }
}

// ── Reader ──────────────────────────────────────────────────────────────

struct Reader {
    shared: Arc<Shared>,
    input: FramedRead<BoxedReader, PacketCodec>,
    channels: HashMap<u8, RecvChannel>,
    pong_req_tx: mpsc::Sender<()>,
    pong_tx: mpsc::Sender<()>,
}

impl Reader {
    async fn run(mut self) {
        let rate = self.shared.config.recv_rate;
        let max_frame = self.shared.max_packet_size;
        loop {
            let wait = self.shared.recv_monitor.delay(rate, max_frame);
            if !wait.is_zero() {
                sleep(wait).await;
                continue;
            }
            let result = match self.input.next().await {
                Some(Ok((packet, n))) => {
                    self.shared.recv_monitor.update(n);
                    self.handle(packet)
                }
                Some(Err(e)) => Err(e),
                None => Err(ConnectionError::Io("connection closed by peer".into())),
            };
            if let Err(e) = result {
                self.shared.stop_for_error(e);
                return;
            }
        }
    }

    fn handle(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match packet.sum {
            Some(Sum::PacketPing(_)) => {
                trace!("received ping");
                // Full means a pong is already on its way.
                let _ = self.pong_req_tx.try_send(());
            }
            Some(Sum::PacketPong(_)) => {
                trace!("received pong");
                let _ = self.pong_tx.try_send(());
            }
            Some(Sum::PacketMsg(msg)) => {
                let channel_id = msg.channel_id;
                let Some((id, channel)) = u8::try_from(channel_id)
                    .ok()
                    .and_then(|id| self.channels.get_mut(&id).map(|c| (id, c)))
                else {
                    return Err(ConnectionError::UnknownChannel(channel_id));
                };
                let max_payload = self.shared.config.max_packet_msg_payload_size;
                if msg.data.len() > max_payload {
                    return Err(ConnectionError::OversizeMessage {
                        size: msg.data.len(),
                        max: max_payload,
                    });
                }
                if let Some(full) = channel.push(msg)? {
                    let _callbacks =
                        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner());
                    if self.shared.is_running() {
                        trace!(channel = id, bytes = full.len(), "received message");
                        self.shared.handler.on_receive(id, full);
                    }
                }
            }
            None => return Err(ConnectionError::Decode("packet without a variant".into())),
        }
        Ok(())
    }
}
