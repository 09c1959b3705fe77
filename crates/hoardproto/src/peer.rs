//! Peers: capabilities over one live connection.
//!
//! ## Read ownership
//!
//! A connection's read half is shared between its decode loop and whoever
//! consumes a raw stream. The handoff is explicit:
//!
//! ```text
//! Decoding ──RAW_STREAM──▶ AwaitingConsumer ──open_stream(n)──▶ StreamingIn(n)
//!    ▲                                                              │
//!    └──────────────────────────close_stream()──────────────────────┘
//! ```
//!
//! The mode lives in a `watch` channel so both sides can wait on it, and the
//! buffered read half sits behind an async mutex. Exactly one party holds
//! that mutex at a time.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{CodecError, Decoder, Unit, RAW_STREAM};
use crate::error::TransportError;

/// Who currently reads from a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// The decode loop owns the read half.
    Decoding,
    /// A raw stream has begun and nobody has claimed it yet.
    AwaitingConsumer,
    /// A consumer owns the read half for this many bytes.
    StreamingIn(u64),
}

/// One remote node, reachable over one connection.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Remote socket address; doubles as the peer's identity.
    fn remote_addr(&self) -> SocketAddr;

    /// Whether this side dialed the connection.
    fn is_outbound(&self) -> bool;

    /// Write pre-framed bytes.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes straight off the connection.
    ///
    /// Only valid while the handshake runs, before the decode loop owns the
    /// read half. Fails with `PermissionDenied` afterwards.
    async fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()>;

    /// Write a `RAW_STREAM` discriminator followed by everything in `reader`.
    ///
    /// Returns the number of body bytes sent.
    async fn send_stream(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, TransportError>;

    /// Claim the inbound raw stream, limited to `size` bytes.
    ///
    /// Waits for the decode loop to reach the stream. Must be followed by
    /// [`Peer::close_stream`] once the bytes have been read.
    async fn open_stream(&self, size: u64) -> Result<InboundStream, TransportError>;

    /// Hand the read half back to the decode loop.
    fn close_stream(&self);

    /// Tear the connection down.
    fn close(&self);
}

type ConnReader = BufReader<OwnedReadHalf>;

struct HeldReader(OwnedMutexGuard<ConnReader>);

impl AsyncRead for HeldReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

/// Exclusive reader over an inbound raw stream.
///
/// Yields exactly the announced size, then EOF. If the connection ends
/// first, the read fails with `UnexpectedEof`. Holds the connection's read
/// half until dropped.
pub struct InboundStream {
    inner: Take<HeldReader>,
}

impl InboundStream {
    /// Bytes still owed by the sender.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl AsyncRead for InboundStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        // The connection hit EOF while bytes were still owed.
        if wanted && buf.filled().len() == before && self.inner.limit() > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("raw stream ended with {} bytes owed", self.inner.limit()),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

/// A peer over a TCP connection.
pub struct TcpPeer {
    remote: SocketAddr,
    outbound: bool,
    reader: Arc<Mutex<ConnReader>>,
    writer: Mutex<OwnedWriteHalf>,
    mode: watch::Sender<StreamMode>,
    handshaking: AtomicBool,
    cancel: CancellationToken,
    stream_timeout: Duration,
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote", &self.remote)
            .field("outbound", &self.outbound)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl TcpPeer {
    pub(crate) fn new(
        stream: TcpStream,
        remote: SocketAddr,
        outbound: bool,
        cancel: CancellationToken,
        stream_timeout: Duration,
    ) -> Self {
        let (read, write) = stream.into_split();
        let (mode, _) = watch::channel(StreamMode::Decoding);

        Self {
            remote,
            outbound,
            reader: Arc::new(Mutex::new(BufReader::new(read))),
            writer: Mutex::new(write),
            mode,
            handshaking: AtomicBool::new(true),
            cancel,
            stream_timeout,
        }
    }

    pub fn mode(&self) -> StreamMode {
        *self.mode.borrow()
    }

    /// Hand the read half over to the decode loop for good.
    pub(crate) fn finish_handshake(&self) {
        self.handshaking.store(false, Ordering::Release);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Decode the next unit, or `None` once the connection is closed locally.
    pub(crate) async fn next_unit(&self, decoder: &dyn Decoder) -> Option<Result<Unit, CodecError>> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            unit = decoder.decode(&mut *reader) => Some(unit),
        }
    }

    /// Park the decode loop while a consumer reads the raw stream that just began.
    ///
    /// Fails if nobody claims the stream within the stream timeout.
    pub(crate) async fn yield_to_consumer(&self) -> Result<(), TransportError> {
        let mut rx = self.mode.subscribe();
        self.mode.send_replace(StreamMode::AwaitingConsumer);

        let claimed = tokio::time::timeout(
            self.stream_timeout,
            rx.wait_for(|m| *m != StreamMode::AwaitingConsumer),
        );
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            res = claimed => match res {
                Err(_) => {
                    return Err(TransportError::Stream(format!(
                        "raw stream not claimed within {:?}",
                        self.stream_timeout
                    )))
                }
                Ok(Err(_)) => return Err(TransportError::Stream("mode channel closed".into())),
                Ok(Ok(_)) => {}
            },
        }

        let released = rx.wait_for(|m| *m == StreamMode::Decoding);
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            res = released => res
                .map(|_| ())
                .map_err(|_| TransportError::Stream("mode channel closed".into())),
        }
    }

    /// Send FIN so the remote side sees EOF.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.remote, error = %e, "shutdown failed");
        }
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        if !self.handshaking.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "connection is owned by the decode loop",
            ));
        }
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await?;
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_stream(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_u8(RAW_STREAM).await?;
        let sent = io::copy(reader, &mut *writer).await?;
        writer.flush().await?;
        Ok(sent)
    }

    async fn open_stream(&self, size: u64) -> Result<InboundStream, TransportError> {
        let mut rx = self.mode.subscribe();
        let awaiting = tokio::time::timeout(
            self.stream_timeout,
            rx.wait_for(|m| *m == StreamMode::AwaitingConsumer),
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(TransportError::Stream("connection closed".into()))
            }
            res = awaiting => match res {
                Err(_) => return Err(TransportError::timeout("open_stream", self.stream_timeout)),
                Ok(Err(_)) => return Err(TransportError::Stream("mode channel closed".into())),
                Ok(Ok(_)) => {}
            },
        }

        let guard = self.reader.clone().lock_owned().await;
        self.mode.send_replace(StreamMode::StreamingIn(size));
        debug!(peer = %self.remote, size, "raw stream claimed");

        Ok(InboundStream {
            inner: HeldReader(guard).take(size),
        })
    }

    fn close_stream(&self) {
        self.mode.send_if_modified(|mode| match *mode {
            StreamMode::StreamingIn(_) => {
                *mode = StreamMode::Decoding;
                true
            }
            _ => false,
        });
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
