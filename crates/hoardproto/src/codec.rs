//! Dual-mode wire codec.
//!
//! ## Wire Format
//!
//! Every unit on a connection begins with a one-byte discriminator:
//!
//! ```text
//! 0x01 STRUCTURED   u32 big-endian length, then that many payload bytes
//! 0x02 RAW_STREAM   nothing more; the bytes that follow belong to whoever
//!                   claims the stream (see Peer::open_stream)
//! ```
//!
//! The raw stream carries no length of its own. Its size comes from the
//! `StoreFile` announcement sent ahead of it.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt};

/// Discriminator for a length-prefixed structured unit.
pub const STRUCTURED: u8 = 0x01;

/// Discriminator announcing a raw byte stream.
pub const RAW_STREAM: u8 = 0x02;

/// Default cap on a structured payload.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024;

/// One decoded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Structured(Bytes),
    RawStream,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown discriminator {0:#04x}")]
    Malformed(u8),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: u64 },
}

impl CodecError {
    /// Whether the connection can no longer be read in step.
    ///
    /// Only an unknown discriminator leaves framing recoverable: the byte is
    /// dropped and decoding resumes with the next one.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Malformed(_))
    }
}

fn eof_as_closed(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Closed
    } else {
        CodecError::Io(e)
    }
}

/// Reads one unit at a time off a connection.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, reader: &mut (dyn AsyncRead + Unpin + Send))
        -> Result<Unit, CodecError>;
}

/// The standard decoder for the format above.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCodec {
    max_frame_len: u32,
}

impl DefaultCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }
}

impl Default for DefaultCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[async_trait]
impl Decoder for DefaultCodec {
    async fn decode(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Unit, CodecError> {
        let tag = reader.read_u8().await.map_err(eof_as_closed)?;

        match tag {
            STRUCTURED => {
                let len = reader.read_u32().await.map_err(eof_as_closed)?;
                if len > self.max_frame_len {
                    return Err(CodecError::FrameTooLarge {
                        len: len as u64,
                        max: self.max_frame_len as u64,
                    });
                }

                let mut payload = vec![0u8; len as usize];
                reader
                    .read_exact(&mut payload)
                    .await
                    .map_err(eof_as_closed)?;
                Ok(Unit::Structured(Bytes::from(payload)))
            }
            RAW_STREAM => Ok(Unit::RawStream),
            other => Err(CodecError::Malformed(other)),
        }
    }
}

/// Frame `payload` as a structured unit.
pub fn structured(payload: &[u8]) -> Result<Bytes, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        len: payload.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(STRUCTURED);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn decode_all(codec: &DefaultCodec, bytes: &[u8]) -> Vec<Result<Unit, CodecError>> {
        let mut reader: &[u8] = bytes;
        let mut out = Vec::new();
        loop {
            let unit = codec.decode(&mut reader).await;
            let done = matches!(unit, Err(ref e) if e.is_fatal());
            out.push(unit);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn test_structured_layout() {
        let framed = structured(b"abc").unwrap();
        assert_eq!(&framed[..], &[STRUCTURED, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_decode_sequence() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&structured(b"one").unwrap());
        wire.push(RAW_STREAM);
        wire.extend_from_slice(&structured(b"").unwrap());

        let units = decode_all(&DefaultCodec::default(), &wire).await;
        assert_eq!(units.len(), 4);
        assert_eq!(
            units[0].as_ref().unwrap(),
            &Unit::Structured(Bytes::from_static(b"one"))
        );
        assert_eq!(units[1].as_ref().unwrap(), &Unit::RawStream);
        assert_eq!(units[2].as_ref().unwrap(), &Unit::Structured(Bytes::new()));
        assert!(matches!(units[3], Err(CodecError::Closed)));
    }

    #[tokio::test]
    async fn test_unknown_discriminator_is_recoverable() {
        let mut wire = vec![0x7f];
        wire.extend_from_slice(&structured(b"after").unwrap());

        let units = decode_all(&DefaultCodec::default(), &wire).await;
        match &units[0] {
            Err(CodecError::Malformed(0x7f)) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
        assert!(!CodecError::Malformed(0x7f).is_fatal());
        assert_eq!(
            units[1].as_ref().unwrap(),
            &Unit::Structured(Bytes::from_static(b"after"))
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let codec = DefaultCodec::new(4);
        let wire = structured(b"too long").unwrap();
        let mut reader: &[u8] = &wire;

        let err = codec.decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 8, max: 4 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_closed() {
        let wire = structured(b"complete").unwrap();
        let mut reader: &[u8] = &wire[..wire.len() - 2];

        let err = DefaultCodec::default().decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }

    #[tokio::test]
    async fn test_empty_input_is_closed() {
        let mut reader: &[u8] = &[];
        let err = DefaultCodec::default().decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Closed));
    }
}
