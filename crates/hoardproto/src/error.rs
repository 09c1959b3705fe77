use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::handshake::HandshakeError;

/// Connection and transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("peer not admitted: {0}")]
    Admission(String),

    #[error("stream protocol violation: {0}")]
    Stream(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),
}

impl TransportError {
    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        TransportError::Timeout { operation, after }
    }
}
