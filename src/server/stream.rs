//! Replay adapter for protocol-detection bytes.
//!
//! The dispatcher consumes up to 16 bytes from a fresh connection to decide
//! between SOCKS5 and HTTP. Whichever handler gets the connection must see
//! those bytes again, so the stream is wrapped: reads drain the saved prefix
//! first, then fall through to the socket. The prefix is consumed exactly
//! once; writes are untouched.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_is_replayed_before_socket_bytes() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b" world").await.unwrap();

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), far);
        let mut out = vec![0u8; 11];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn test_short_reads_consume_prefix_incrementally() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b"cd").await.unwrap();

        let mut stream = PrefixedStream::new(Bytes::from_static(b"ab"), far);
        let mut one = [0u8; 1];
        for expected in [b'a', b'b', b'c', b'd'] {
            stream.read_exact(&mut one).await.unwrap();
            assert_eq!(one[0], expected);
        }
    }

    #[tokio::test]
    async fn test_writes_bypass_the_prefix() {
        let (far, mut near) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"unused"), far);
        stream.write_all(b"ping").await.unwrap();

        let mut out = [0u8; 4];
        near.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }
}
