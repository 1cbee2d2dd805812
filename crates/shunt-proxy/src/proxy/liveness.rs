//! Client connection liveness tracking.
//!
//! Reconnects only make sense while the client is still waiting for the
//! response. [`TrackedIo`] wraps the client side of a connection and flips a
//! shared flag once the connection reaches EOF, fails, is shut down or is
//! dropped.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared view of whether a client connection is still open.
#[derive(Debug, Clone, Default)]
pub struct ClientLiveness {
    closed: Arc<AtomicBool>,
}

impl ClientLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// I/O wrapper reporting connection teardown to a [`ClientLiveness`].
pub struct TrackedIo<T> {
    inner: T,
    liveness: ClientLiveness,
}

impl<T> TrackedIo<T> {
    pub fn new(inner: T) -> (Self, ClientLiveness) {
        let liveness = ClientLiveness::new();
        (
            Self {
                inner,
                liveness: liveness.clone(),
            },
            liveness,
        )
    }
}

impl<T> Drop for TrackedIo<T> {
    fn drop(&mut self) {
        self.liveness.mark_closed();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TrackedIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wants_data = buf.remaining() > 0;
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if wants_data && buf.filled().len() == before => {
                self.liveness.mark_closed()
            }
            Poll::Ready(Err(_)) => self.liveness.mark_closed(),
            _ => {}
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TrackedIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            self.liveness.mark_closed();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            self.liveness.mark_closed();
        }
        result
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.liveness.mark_closed();
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Err(_)) = &result {
            self.liveness.mark_closed();
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
