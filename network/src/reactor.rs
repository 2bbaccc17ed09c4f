//! The seam between the peer switch and the protocols running over it.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ChannelDescriptor;
use crate::peer::Peer;
use crate::NetworkError;

/// A protocol engine driven by the switch.
///
/// The switch collects every reactor's channels into each new connection,
/// routes inbound messages by channel, and reports peer lifecycle events.
pub trait Reactor: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Channels this reactor owns.
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// Prepare per-peer state before the peer is started.
    /// An error refuses the peer.
    fn init_peer(&self, peer: &Arc<Peer>) -> Result<(), NetworkError>;

    /// The peer is running; begin serving it.
    fn add_peer(&self, peer: Arc<Peer>);

    /// The peer is gone. Release everything held for it.
    fn remove_peer(&self, peer: &Arc<Peer>, reason: &str);

    /// A complete message arrived from `peer` on one of this reactor's
    /// channels.
    fn receive(&self, channel_id: u8, peer: &Arc<Peer>, msg: Bytes);
}
