use std::io;

use bridge_proto::ProtocolError;
use resilience::{Classify, ErrorKind, ResilienceError, kind_for_status};

/// Failure of a single exchange with the guest.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bridge channel not attached")]
    NotReady,

    #[error("bridge channel closed")]
    ChannelClosed,

    #[error("bridge i/o: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("guest error: {message}")]
    Remote { message: String },

    #[error("unexpected response: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },

    #[error("direct path: {0}")]
    Http(#[from] reqwest::Error),
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady => ErrorKind::Initialization,
            Self::ChannelClosed | Self::Io(_) | Self::Http(_) => ErrorKind::Transport,
            Self::Protocol(_) | Self::Unexpected { .. } => ErrorKind::Internal,
            Self::Remote { .. } => ErrorKind::Execution,
            Self::InvalidRequest(_) => ErrorKind::Client,
            Self::Status { status, .. } => kind_for_status(*status),
        }
    }
}

/// Error returned by every [`Bridge`](crate::Bridge) call.
pub type BridgeError = ResilienceError<TransportError>;

pub type Result<T> = std::result::Result<T, BridgeError>;
