//! Multiplexer framing: the packets every connection is made of.
//!
//! A frame on the stream is a protobuf varint length prefix followed by an
//! encoded [`Packet`]. Field numbers:
//!
//! | field | variant | contents |
//! |---|---|---|
//! | 1 | `PacketPing` | empty |
//! | 2 | `PacketPong` | empty |
//! | 3 | `PacketMsg` | `channel_id` (1), `eof` (2), `data` (3) |

use bytes::Bytes;
use prost::Message as _;

use crate::MessageError;

/// Keepalive request. The receiver answers with a [`PacketPong`].
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PacketPing {}

/// Keepalive answer.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PacketPong {}

/// One fragment of a logical message on a channel.
///
/// `channel_id` is an `int32` on the wire even though local channels are
/// bytes; the receiver rejects anything outside the registered set.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PacketMsg {
    #[prost(int32, tag = "1")]
    pub channel_id: i32,
    /// Set on the last fragment of a logical message.
    #[prost(bool, tag = "2")]
    pub eof: bool,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
}

/// Top-level frame envelope.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Packet {
    #[prost(oneof = "packet::Sum", tags = "1, 2, 3")]
    pub sum: ::core::option::Option<packet::Sum>,
}

pub mod packet {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Sum {
        #[prost(message, tag = "1")]
        PacketPing(super::PacketPing),
        #[prost(message, tag = "2")]
        PacketPong(super::PacketPong),
        #[prost(message, tag = "3")]
        PacketMsg(super::PacketMsg),
    }
}

impl Packet {
    pub fn ping() -> Self {
        Self {
            sum: Some(packet::Sum::PacketPing(PacketPing {})),
        }
    }

    pub fn pong() -> Self {
        Self {
            sum: Some(packet::Sum::PacketPong(PacketPong {})),
        }
    }

    pub fn msg(channel_id: u8, eof: bool, data: Bytes) -> Self {
        Self {
            sum: Some(packet::Sum::PacketMsg(PacketMsg {
                channel_id: i32::from(channel_id),
                eof,
                data,
            })),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match &self.sum {
            Some(packet::Sum::PacketPing(_)) => "ping",
            Some(packet::Sum::PacketPong(_)) => "pong",
            Some(packet::Sum::PacketMsg(_)) => "msg",
            None => "empty",
        }
    }

    /// Encode with its varint length prefix, ready to be written to a stream.
    pub fn encode_delimited(&self) -> Bytes {
        Bytes::from(self.encode_length_delimited_to_vec())
    }

    /// Decode a packet body (without the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Self, MessageError> {
        Self::decode(body).map_err(|e| MessageError::Decode {
            kind: "packet",
            reason: e.to_string(),
        })
    }
}

/// Full encoded size of a message packet carrying `max_payload` bytes,
/// length prefix included.
///
/// The channel id is taken as `u8::MAX` so the bound holds for every
/// registrable channel.
pub fn max_packet_msg_size(max_payload: usize) -> usize {
    let packet = Packet::msg(u8::MAX, true, Bytes::from(vec![0u8; max_payload]));
    let body = packet.encoded_len();
    body + prost::length_delimiter_len(body)
}
