//! Structured messages exchanged between nodes.
//!
//! A [`Message`] travels bincode-encoded inside a structured unit (see
//! [`crate::codec`]). The set of variants is closed: receivers dispatch with
//! an exhaustive `match`.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// "A raw stream of exactly `size` bytes for `key` follows."
    ///
    /// Sent both when replicating a new entry and when answering a
    /// [`Message::GetFile`].
    StoreFile { key: String, size: u64 },

    /// "Send me `key` if you have it."
    GetFile { key: String },
}

impl Message {
    pub fn store_file(key: impl Into<String>, size: u64) -> Self {
        Message::StoreFile {
            key: key.into(),
            size,
        }
    }

    pub fn get_file(key: impl Into<String>) -> Self {
        Message::GetFile { key: key.into() }
    }

    /// The key this message is about.
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. } | Message::GetFile { key } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(MessageError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// One structured unit as it arrived, tagged with the sending connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub from: SocketAddr,
    pub payload: Bytes,
}

impl InboundRecord {
    pub fn message(&self) -> Result<Message, MessageError> {
        Message::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_store_file_roundtrip() {
        let msg = Message::store_file("momsbestpicture", 7);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.key(), "momsbestpicture");
    }

    #[test]
    fn test_get_file_roundtrip() {
        let msg = Message::get_file("k");
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result = Message::decode(&[0xff, 0xff, 0xff, 0xff, 0x00]);
        assert!(matches!(result, Err(MessageError::Decode(_))));
    }

    #[test]
    fn test_truncated_is_decode_error() {
        let bytes = Message::store_file("truncated", 1).encode().unwrap();
        assert!(Message::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_record_message() {
        let record = InboundRecord {
            from: "127.0.0.1:3000".parse().unwrap(),
            payload: Bytes::from(Message::get_file("x").encode().unwrap()),
        };
        assert_eq!(record.message().unwrap(), Message::get_file("x"));
    }
}
