use thiserror::Error;

/// A condition that terminates a multiplexed connection.
///
/// Reported to the connection's handler exactly once; the connection is
/// `Errored` afterwards and never delivers another message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("malformed packet: {0}")]
    Decode(String),

    #[error("unknown channel {0:#x}")]
    UnknownChannel(i32),

    #[error("message of {size} bytes exceeds the limit of {max}")]
    OversizeMessage { size: usize, max: usize },

    #[error("frame of {size} bytes exceeds the limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("pong timeout")]
    PongTimeout,

    #[error("IO error: {0}")]
    Io(String),

    #[error("connection already started")]
    AlreadyStarted,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<halyard_messages::MessageError> for ConnectionError {
    fn from(e: halyard_messages::MessageError) -> Self {
        Self::Decode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("peer {peer} refused: {reason}")]
    PeerRefused { peer: String, reason: String },

    #[error("duplicate channel {0:#x}")]
    DuplicateChannel(u8),

    #[error("invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
