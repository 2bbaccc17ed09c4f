//! Mempool gossip payload.
//!
//! Carried on both mempool channels. A `Txs` batch may hold several
//! transactions, but the gossip engine always sends exactly one per message.

use bytes::Bytes;
use prost::Message as _;

use crate::MessageError;

/// A batch of raw transactions.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Txs {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub txs: Vec<Bytes>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Message {
    #[prost(oneof = "message::Sum", tags = "1")]
    pub sum: ::core::option::Option<message::Sum>,
}

pub mod message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Sum {
        #[prost(message, tag = "1")]
        Txs(super::Txs),
    }
}

impl Message {
    pub fn txs(txs: Vec<Bytes>) -> Self {
        Self {
            sum: Some(message::Sum::Txs(Txs { txs })),
        }
    }

    /// Encode a message carrying a single transaction.
    pub fn encode_single(tx: Bytes) -> Bytes {
        Bytes::from(Self::txs(vec![tx]).encode_to_vec())
    }

    /// Decode a received payload into its transactions.
    ///
    /// A payload that decodes but carries no variant is an error: the
    /// sender speaks something other than the mempool protocol.
    pub fn decode_txs(payload: &[u8]) -> Result<Vec<Bytes>, MessageError> {
        let msg = Self::decode(payload).map_err(|e| MessageError::Decode {
            kind: "mempool message",
            reason: e.to_string(),
        })?;
        match msg.sum {
            Some(message::Sum::Txs(txs)) => Ok(txs.txs),
            None => Err(MessageError::Empty("mempool message")),
        }
    }
}

/// Encoded size of a batch holding one transaction of `max_tx_bytes`.
/// Used as the receive capacity of the mempool channels.
pub fn max_txs_message_size(max_tx_bytes: usize) -> usize {
    Message::txs(vec![Bytes::from(vec![0u8; max_tx_bytes])]).encoded_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tx_round_trip() {
        let payload = Message::encode_single(Bytes::from_static(b"tx-1"));
        let txs = Message::decode_txs(&payload).unwrap();
        assert_eq!(txs, vec![Bytes::from_static(b"tx-1")]);
    }

    #[test]
    fn empty_message_is_rejected() {
        let payload = Message::default().encode_to_vec();
        assert_eq!(
            Message::decode_txs(&payload).unwrap_err(),
            MessageError::Empty("mempool message")
        );
    }

    #[test]
    fn empty_batch_decodes_to_no_txs() {
        let payload = Message::txs(Vec::new()).encode_to_vec();
        assert!(Message::decode_txs(&payload).unwrap().is_empty());
    }

    #[test]
    fn capacity_covers_largest_tx() {
        let cap = max_txs_message_size(1000);
        let payload = Message::encode_single(Bytes::from(vec![1u8; 1000]));
        assert_eq!(payload.len(), cap);
    }
}
