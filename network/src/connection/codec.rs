//! Length-delimited packet framing for `tokio_util` framed streams.

use bytes::{Buf, BytesMut};
use halyard_messages::Packet;
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};

use crate::ConnectionError;

/// Longest valid varint for a 64-bit length.
const MAX_VARINT_LEN: usize = 10;

/// Varint length prefix followed by a protobuf [`Packet`].
///
/// Decoded items carry the frame's size on the wire, prefix included.
/// Frames longer than `max_frame` are rejected from their prefix, before
/// the body is buffered.
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    max_frame: usize,
}

impl PacketCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

/// Bytes `packet` takes on the wire once framed.
pub fn frame_len(packet: &Packet) -> usize {
    let body = packet.encoded_len();
    body + prost::length_delimiter_len(body)
}

impl Decoder for PacketCodec {
    type Item = (Packet, usize);
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, ConnectionError> {
        let Some(last) = src.iter().take(MAX_VARINT_LEN).position(|b| b & 0x80 == 0) else {
            if src.len() >= MAX_VARINT_LEN {
                return Err(ConnectionError::Decode("invalid length prefix".into()));
            }
            return Ok(None);
        };
        let prefix = last + 1;
        let len = prost::decode_length_delimiter(&src[..prefix])
            .map_err(|e| ConnectionError::Decode(e.to_string()))?;

        let total = len.checked_add(prefix).unwrap_or(usize::MAX);
        if total > self.max_frame {
            return Err(ConnectionError::FrameTooLarge {
                size: total,
                max: self.max_frame,
            });
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        let body = src.split_to(len);
        let packet = Packet::decode_body(&body)?;
        Ok(Some((packet, total)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ConnectionError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ConnectionError> {
        dst.reserve(frame_len(&packet));
        packet
            .encode_length_delimited(dst)
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use halyard_messages::max_packet_msg_size;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn encode(packets: &[Packet]) -> BytesMut {
        let mut codec = PacketCodec::new(usize::MAX);
        let mut buf = BytesMut::new();
        for packet in packets {
            codec.encode(packet.clone(), &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn frames_decode_when_fed_a_byte_at_a_time() {
        let msg = Packet::msg(7, true, Bytes::from_static(b"hello"));
        let wire = encode(&[Packet::ping(), msg.clone()]);
        let mut codec = PacketCodec::new(max_packet_msg_size(1024));

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            if let Some(item) = codec.decode(&mut buf).unwrap() {
                decoded.push(item);
            }
        }
        assert!(buf.is_empty());
        assert_eq!(
            decoded,
            vec![
                (Packet::ping(), frame_len(&Packet::ping())),
                (msg.clone(), frame_len(&msg)),
            ]
        );
        assert_eq!(decoded[0].1 + decoded[1].1, wire.len());
    }

    #[test]
    fn oversize_frame_is_rejected_from_its_prefix() {
        let big = Packet::msg(1, true, Bytes::from(vec![0u8; 2000]));
        let wire = encode(&[big]);
        // Prefix plus one body byte: the rest never has to arrive.
        let mut buf = BytesMut::from(&wire[..3]);

        let err = PacketCodec::new(max_packet_msg_size(1024))
            .decode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, ConnectionError::FrameTooLarge { .. }));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut buf = BytesMut::from(&[0x05u8, 1, 2, 3, 4, 5][..]);
        let err = PacketCodec::new(1024).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
    }

    #[test]
    fn endless_varint_is_a_decode_error() {
        let mut codec = PacketCodec::new(usize::MAX);
        let mut buf = BytesMut::from(&[0xffu8; 3][..]);
        assert_eq!(codec.decode(&mut buf), Ok(None));

        buf.extend_from_slice(&[0xff; 9]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut sink = FramedWrite::new(a, PacketCodec::new(usize::MAX));
        let mut stream = FramedRead::new(b, PacketCodec::new(1024));
        let msg = Packet::msg(3, false, Bytes::from_static(b"fragment"));

        sink.send(Packet::pong()).await.unwrap();
        sink.send(msg.clone()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().0, Packet::pong());
        assert_eq!(stream.next().await.unwrap().unwrap().0, msg);
    }

    #[tokio::test]
    async fn truncated_frame_at_eof_is_an_io_error() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0x04, 0x08]).await.unwrap();
        drop(a);

        let mut stream = FramedRead::new(b, PacketCodec::new(1024));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
    }

    #[tokio::test]
    async fn clean_eof_ends_the_stream() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut stream = FramedRead::new(b, PacketCodec::new(1024));
        assert!(stream.next().await.is_none());
    }
}
