use std::net::SocketAddr;
use std::time::Duration;

use cas::StoreError;
use hoardproto::{MessageError, TransportError};
use thiserror::Error;

/// Failures surfaced to callers of `FileServer`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("no registered peer at {0}")]
    PeerNotFound(SocketAddr),

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{key} not found locally or on any peer")]
    NotFound { key: String },

    #[error("raw stream for {key} delivered {actual} of {expected} bytes")]
    ShortStream {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("server has not been started")]
    NotStarted,

    #[error("server was already started")]
    AlreadyStarted,
}

impl ServerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ServerError::NotFound { .. } => true,
            ServerError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
