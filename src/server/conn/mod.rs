//! Accepted connections and the protocol codec seam.
//!
//! A listener hands every accepted [`Connection`] to an [`OpenListener`],
//! which speaks the wire protocol and drives the root handler. Codecs are
//! produced by a [`CodecFactory`] registered per listener protocol; the HTTP
//! codec is built in, AJP framing is supplied by the embedding application.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    errors::PorticoError,
    server::{buffer_pool::BufferPool, virtual_host::Handler},
    ssl::{SslSessionHolder, SslSessionInfo},
};

pub mod http;

/// Transport of an accepted connection.
pub enum Io {
    Plain(TcpStream),
    #[cfg(feature = "tokio-rust-tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Io::Plain(stream) => stream.is_write_vectored(),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tokio-rust-tls")]
            Io::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Per-connection facts codecs attach to every request.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    peer_addr: SocketAddr,
    ssl_session: Option<Arc<SslSessionHolder>>,
}

impl ConnectionInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self { peer_addr, ssl_session: None }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Session slot of a TLS connection.
    pub fn ssl_session(&self) -> Option<&Arc<SslSessionHolder>> {
        self.ssl_session
            .as_ref()
    }
}

/// An accepted connection ready for a codec.
pub struct Connection {
    io: Io,
    info: ConnectionInfo,
}

impl Connection {
    pub fn new(io: Io, peer_addr: SocketAddr) -> Self {
        Self { io, info: ConnectionInfo::new(peer_addr) }
    }

    /// Attaches the TLS session negotiated for this connection.
    pub fn with_ssl_session(mut self, session: SslSessionInfo) -> Self {
        self.info
            .ssl_session = Some(Arc::new(SslSessionHolder::new(session)));
        self
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn into_parts(self) -> (Io, ConnectionInfo) {
        (self.io, self.info)
    }
}

/// A protocol codec bound to a root handler.
pub trait OpenListener: Send + Sync {
    /// Sets the handler every decoded request is dispatched to.
    fn set_root_handler(&mut self, handler: Handler);

    /// Serves one connection until the peer goes away.
    fn handle_connection(&self, connection: Connection) -> BoxFuture<'static, Result<(), PorticoError>>;
}

/// Produces codecs for one listener protocol.
pub trait CodecFactory: Send + Sync {
    /// Creates a codec reading through buffers of `buffer_size` bytes taken
    /// from `pool`.
    fn create(&self, pool: BufferPool, buffer_size: usize) -> Box<dyn OpenListener>;
}
