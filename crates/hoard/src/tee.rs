//! Async reader adapter that copies everything it yields into a buffer.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{self, AsyncRead, ReadBuf};

/// Copies everything read through it into a buffer.
pub struct TeeReader<'a, R: ?Sized> {
    inner: &'a mut R,
    sink: &'a mut Vec<u8>,
}

impl<'a, R: ?Sized> TeeReader<'a, R> {
    pub fn new(inner: &'a mut R, sink: &'a mut Vec<u8>) -> Self {
        Self { inner, sink }
    }
}

impl<R: AsyncRead + Unpin + ?Sized> AsyncRead for TeeReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.sink.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_tee_copies_everything() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let mut source = data.as_slice();
        let mut copy = Vec::new();

        let mut out = Vec::new();
        TeeReader::new(&mut source, &mut copy)
            .read_to_end(&mut out)
            .await
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(copy, data);
    }

    #[tokio::test]
    async fn test_tee_empty() {
        let mut source: &[u8] = &[];
        let mut copy = Vec::new();
        let mut out = Vec::new();
        TeeReader::new(&mut source, &mut copy)
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert!(copy.is_empty());
    }
}
