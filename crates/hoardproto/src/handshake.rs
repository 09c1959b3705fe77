//! Per-connection handshake, run once before any protocol traffic.
//!
//! A handshake may write with [`Peer::send`] and read with
//! [`Peer::recv_exact`]; both talk to the raw connection, so a
//! challenge/response exchange can run before framing starts.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::TransportError;
use crate::peer::Peer;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send failed: {0}")]
    Send(#[source] Box<TransportError>),
}

impl From<TransportError> for HandshakeError {
    fn from(e: TransportError) -> Self {
        HandshakeError::Send(Box::new(e))
    }
}

/// Decides whether a freshly connected peer may proceed.
///
/// Runs under the transport's handshake deadline. An error closes the
/// connection; there is no retry.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, peer: &dyn Peer) -> Result<(), HandshakeError>;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &dyn Peer) -> Result<(), HandshakeError> {
        Ok(())
    }
}
