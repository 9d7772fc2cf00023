//! Bandwidth-limited wrapper around a byte stream.

use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use futures::ready;
use pin_project::{pin_project, pinned_drop};

use crate::alloc::Allocator;
use crate::Result;

/// An in-flight or completed request for bandwidth.
///
/// Reads and writes each keep their own `Grant`, so a split stream can be
/// driven from both ends at once. A completed grant survives `Pending`
/// polls of the inner stream: a slow peer must not cause the same bytes to
/// be charged twice.
enum Grant {
    /// No bandwidth requested.
    Idle,
    /// Waiting on the allocator.
    Pending(BoxFuture<'static, Result<u64>>),
    /// Granted, not yet spent on inner I/O.
    Ready(u64),
}

/// A byte stream whose reads and writes obey an [`Allocator`]'s limits.
///
/// Wraps any `AsyncRead + AsyncWrite` stream. Each read or write first
/// obtains a grant `g` bounded by the per-connection limit, then performs a
/// single underlying operation on at most `g` bytes. The underlying
/// operation may move fewer bytes than granted; tokens for the unused
/// remainder stay charged.
///
/// Closing the stream closes its allocator first, so anything still blocked
/// on a grant fails promptly with [`Error::Closed`](crate::Error::Closed).
/// Dropping the stream closes the allocator too, so a listener's weak
/// registration of it never outlives the connection, even when a caller
/// keeps a clone of the allocator handle.
#[pin_project(PinnedDrop)]
pub struct Throttled<S> {
    /// Broker for every read and write on this stream.
    alloc: Arc<Allocator>,
    /// Grant state for the read half.
    read_grant: Grant,
    /// Grant state for the write half.
    write_grant: Grant,
    /// The underlying stream.
    #[pin]
    inner: S,
}

impl<S> Throttled<S> {
    /// Wrap `inner` so its I/O is brokered by `alloc`.
    pub fn new(inner: S, alloc: Arc<Allocator>) -> Self {
        Throttled {
            alloc,
            read_grant: Grant::Idle,
            write_grant: Grant::Idle,
            inner,
        }
    }

    /// The allocator brokering this stream's bandwidth.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// A reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// A mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

#[pinned_drop]
impl<S> PinnedDrop for Throttled<S> {
    fn drop(self: Pin<&mut Self>) {
        self.alloc.close();
    }
}

/// Drive `grant` until it holds a usable amount for a request of `n` bytes.
fn poll_grant(
    alloc: &Arc<Allocator>,
    grant: &mut Grant,
    cx: &mut Context<'_>,
    n: u64,
) -> Poll<IoResult<u64>> {
    loop {
        match grant {
            Grant::Ready(g) => return Poll::Ready(Ok(*g)),
            Grant::Pending(fut) => match ready!(fut.as_mut().poll(cx)) {
                Ok(g) => *grant = Grant::Ready(g),
                Err(e) => {
                    *grant = Grant::Idle;
                    return Poll::Ready(Err(std::io::Error::other(e)));
                }
            },
            Grant::Idle => {
                let alloc = Arc::clone(alloc);
                *grant = Grant::Pending(Box::pin(async move { alloc.allocate(n).await }));
            }
        }
    }
}

impl<S: AsyncRead> AsyncRead for Throttled<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_read(cx, buf);
        }
        let granted = ready!(poll_grant(this.alloc, this.read_grant, cx, buf.len() as u64))?;
        let n = (granted as usize).min(buf.len());
        let read = ready!(this.inner.poll_read(cx, &mut buf[..n]));
        *this.read_grant = Grant::Idle;
        Poll::Ready(read)
    }
}

impl<S: AsyncWrite> AsyncWrite for Throttled<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }
        let granted = ready!(poll_grant(this.alloc, this.write_grant, cx, buf.len() as u64))?;
        let n = (granted as usize).min(buf.len());
        let written = ready!(this.inner.poll_write(cx, &buf[..n]));
        *this.write_grant = Grant::Idle;
        Poll::Ready(written)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = self.project();
        this.alloc.close();
        this.inner.poll_close(cx)
    }
}
