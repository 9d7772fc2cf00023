//! Transport plumbing: a minimal listener abstraction and its TCP
//! implementation.
//!
//! The throttling core only needs two things from a transport: a way to
//! accept byte-duplex streams, and the streams themselves speaking the
//! `futures` I/O traits. For TCP, `tokio_util`'s compat wrapper already
//! makes tokio's stream do exactly that, so accepted streams are handed
//! out as [`Compat<tokio::net::TcpStream>`](Compat) directly.

use std::io::Result as IoResult;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};

/// A source of accepted byte streams.
#[async_trait]
pub trait NetListener {
    /// The stream type produced for each accepted connection.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin;

    /// Wait for and return the next incoming connection.
    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> IoResult<SocketAddr>;
}

/// An accepted TCP stream, speaking the `futures` I/O traits.
pub type TcpStream = Compat<TokioTcpStream>;

/// The local address of an accepted [`TcpStream`].
pub fn local_addr(stream: &TcpStream) -> IoResult<SocketAddr> {
    stream.get_ref().local_addr()
}

/// The remote address of an accepted [`TcpStream`].
pub fn peer_addr(stream: &TcpStream) -> IoResult<SocketAddr> {
    stream.get_ref().peer_addr()
}

/// A TCP listener that yields [`TcpStream`]s.
pub struct TcpListener {
    /// The underlying listener.
    lis: TokioTcpListener,
}

impl TcpListener {
    /// Bind a TCP listener to `addr`.
    pub async fn bind<A: tokio::net::ToSocketAddrs>(addr: A) -> IoResult<Self> {
        let lis = TokioTcpListener::bind(addr).await?;
        Ok(TcpListener { lis })
    }
}

#[async_trait]
impl NetListener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)> {
        let (stream, addr) = self.lis.accept().await?;
        Ok((stream.compat(), addr))
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        self.lis.local_addr()
    }
}
