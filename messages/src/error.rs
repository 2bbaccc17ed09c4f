use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("failed to decode {kind}: {reason}")]
    Decode { kind: &'static str, reason: String },

    #[error("{0} carries no payload")]
    Empty(&'static str),
}
