//! Deferred-header stream wrapper.
//!
//! The trojan and SimpleSocks clients must put their request header on the
//! wire in the same write as the first payload bytes whenever possible: a
//! lone small record right after the handshake is a telltale. This wrapper
//! holds the header and folds the first payload write into it; if the
//! protocol expects the peer to speak first, the first read (or flush)
//! pushes the bare header out instead.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) struct HeaderStream<S> {
    inner: S,
    /// Header bytes (plus any coalesced first payload) not yet written.
    pending: BytesMut,
    /// Payload bytes folded into `pending`, to be acknowledged to the
    /// caller once the combined buffer is on the wire.
    coalesced: usize,
}

impl<S> HeaderStream<S> {
    pub(crate) fn new(header: BytesMut, inner: S) -> Self {
        Self {
            inner,
            pending: header,
            coalesced: 0,
        }
    }
}

impl<S: AsyncWrite + Unpin> HeaderStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for HeaderStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Peer-speaks-first: get the header out before waiting for data.
        if !self.pending.is_empty() {
            ready!(self.poll_drain(cx))?;
            ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for HeaderStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.pending.is_empty() && self.coalesced == 0 {
            return Pin::new(&mut self.inner).poll_write(cx, data);
        }
        // First payload write: fold it into the header buffer once, then
        // put the combined bytes on the wire as a single write.
        if self.coalesced == 0 {
            self.pending.extend_from_slice(data);
            self.coalesced = data.len();
        }
        ready!(self.poll_drain(cx))?;
        let n = std::mem::take(&mut self.coalesced);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
