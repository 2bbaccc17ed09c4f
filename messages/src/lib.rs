//! Wire envelopes exchanged between Halyard nodes.
//!
//! Two layers travel over a peer connection:
//! - [`p2p`]: the multiplexer's framing (`Packet`: ping, pong, message fragment).
//! - [`mempool`]: the payload carried on the mempool gossip channels.
//!
//! Both are protobuf messages encoded with `prost`. Field numbers are part of
//! the protocol and must not change.

pub mod error;
pub mod mempool;
pub mod p2p;

pub use error::MessageError;
pub use mempool::{max_txs_message_size, Message as MempoolMessage, Txs};
pub use p2p::{max_packet_msg_size, Packet, PacketMsg, PacketPing, PacketPong};
