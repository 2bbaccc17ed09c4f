//! Logical channels of a multiplexed connection.
//!
//! The send side is split in two: a [`ChannelHandle`] kept by the
//! connection for enqueueing, and a [`SendChannel`] owned by the writer
//! task that fragments queued messages into packets. Inbound fragments are
//! reassembled by a [`RecvChannel`] owned by the reader task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use halyard_messages::{Packet, PacketMsg};
use tokio::sync::mpsc;

use crate::ConnectionError;

/// Default receive reassembly limit (21 MiB).
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096;

/// Static description of a channel, registered at connection construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: u8,
    /// Relative share of outbound bandwidth. Higher wins.
    pub priority: i32,
    /// Messages that may wait in the send queue.
    pub send_queue_capacity: usize,
    /// Largest reassembled inbound message.
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u8, priority: i32) -> Self {
        Self {
            id,
            priority,
            send_queue_capacity: 1,
            recv_message_capacity: DEFAULT_RECV_MESSAGE_CAPACITY,
        }
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }
}

/// Per-channel snapshot reported by `MConnection::status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStatus {
    pub id: u8,
    pub priority: i32,
    pub send_queue_capacity: usize,
    pub send_queue_size: usize,
    pub recently_sent: i64,
}

/// Build the two halves of a channel's send path.
pub(crate) fn send_pair(desc: &ChannelDescriptor) -> (ChannelHandle, SendChannel) {
    let (tx, rx) = mpsc::channel(desc.send_queue_capacity.max(1));
    let recently_sent = Arc::new(AtomicI64::new(0));
    let handle = ChannelHandle {
        desc: desc.clone(),
        tx,
        recently_sent: recently_sent.clone(),
    };
    let sender = SendChannel {
        id: desc.id,
        priority: desc.priority,
        queue: rx,
        sending: None,
        recently_sent,
    };
    (handle, sender)
}

/// Enqueueing side of a channel.
pub(crate) struct ChannelHandle {
    pub(crate) desc: ChannelDescriptor,
    pub(crate) tx: mpsc::Sender<Bytes>,
    recently_sent: Arc<AtomicI64>,
}

impl ChannelHandle {
    pub(crate) fn status(&self) -> ChannelStatus {
        ChannelStatus {
            id: self.desc.id,
            priority: self.desc.priority,
            send_queue_capacity: self.tx.max_capacity(),
            send_queue_size: self.tx.max_capacity() - self.tx.capacity(),
            recently_sent: self.recently_sent.load(Ordering::Relaxed),
        }
    }
}

/// Writer-side state of a channel.
pub(crate) struct SendChannel {
    id: u8,
    priority: i32,
    queue: mpsc::Receiver<Bytes>,
    /// Message currently being fragmented and the offset of its next byte.
    sending: Option<(Bytes, usize)>,
    recently_sent: Arc<AtomicI64>,
}

impl SendChannel {
    /// Whether a packet is ready to go out, pulling the next queued
    /// message if nothing is in flight.
    pub(crate) fn is_pending(&mut self) -> bool {
        if self.sending.is_none() {
            match self.queue.try_recv() {
                Ok(msg) => self.sending = Some((msg, 0)),
                Err(_) => return false,
            }
        }
        true
    }

    /// Next fragment of the in-flight message, at most `max_payload` bytes.
    pub(crate) fn next_packet(&mut self, max_payload: usize) -> Option<Packet> {
        if !self.is_pending() {
            return None;
        }
        let (msg, offset) = self.sending.take()?;
        let end = msg.len().min(offset + max_payload);
        let eof = end == msg.len();
        let packet = Packet::msg(self.id, eof, msg.slice(offset..end));
        if !eof {
            self.sending = Some((msg, end));
        }
        Some(packet)
    }

    /// Lower is more deserving of the next batch.
    pub(crate) fn ratio(&self) -> f64 {
        self.recently_sent.load(Ordering::Relaxed) as f64 / f64::from(self.priority.max(1))
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.recently_sent.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Age the recent-traffic counter by 20%.
    pub(crate) fn decay(&self) {
        let current = self.recently_sent.load(Ordering::Relaxed);
        self.recently_sent
            .store((current as f64 * 0.8) as i64, Ordering::Relaxed);
    }
}

/// Reader-side reassembly buffer of a channel.
pub(crate) struct RecvChannel {
    capacity: usize,
    buf: BytesMut,
}

impl RecvChannel {
    pub(crate) fn new(desc: &ChannelDescriptor) -> Self {
        Self {
            capacity: desc.recv_message_capacity,
            buf: BytesMut::new(),
        }
    }

    /// Append a fragment. Returns the complete message on `eof`.
    ///
    /// Overflowing the capacity discards the partial message.
    pub(crate) fn push(&mut self, packet: PacketMsg) -> Result<Option<Bytes>, ConnectionError> {
        let size = self.buf.len() + packet.data.len();
        if size > self.capacity {
            self.buf.clear();
            return Err(ConnectionError::OversizeMessage {
                size,
                max: self.capacity,
            });
        }
        self.buf.extend_from_slice(&packet.data);
        if packet.eof {
            return Ok(Some(self.buf.split().freeze()));
        }
        Ok(None)
    }
}
