//! Peer transport for the Halyard node.
//!
//! Multiplexed, rate-limited keep-alive connections ([`MConnection`]), the
//! [`Peer`] wrapper the switch hands to protocol reactors, and the
//! [`Reactor`] trait those protocols implement.

pub mod connection;
pub mod error;
pub mod flow_rate;
pub mod peer;
pub mod reactor;

pub use connection::{
    ChannelDescriptor, ChannelStatus, ConnState, ConnectionHandler, ConnectionStatus, MConnConfig,
    MConnection,
};
pub use error::{ConnectionError, NetworkError};
pub use flow_rate::{FlowMonitor, MonitorStatus};
pub use peer::{Peer, PeerFault, PeerId};
pub use reactor::Reactor;
