//! Stackable tunnel layers.
//!
//! Every layer exposes a client capability (open outbound flows toward a
//! destination) and a server capability (accept inbound flows and surface
//! the decoded destination). Layers compose leaves-first: the server of
//! layer N is built over the server of layer N-1, the client of layer N
//! over the client of layer N-1. Metadata decoded at a layer is meaningful
//! to the layer above it; everything below treats payload as opaque bytes.
//!
//! The stack, bottom to top:
//!
//! - [`transport`]: raw TCP acceptor / dialer (leaf)
//! - [`tls`]: TLS termination/initiation, with handshake-failure redirection
//! - [`shadowsocks`]: optional AEAD obfuscation
//! - [`trojan`]: hash-authenticated framing with anti-probing fallback
//! - [`mux`] + [`simplesocks`]: optional stream multiplexing
//! - [`websocket`]: optional HTTP Upgrade framing
//! - [`adapter`] / [`forward`]: local-side entry points
//! - [`freedom`]: direct dialer, the router's bypass target
//!
//! [`redirector`] is the shared worker every redirecting layer submits to.

pub mod adapter;
pub mod forward;
pub mod freedom;
mod header;
pub mod http;
pub mod mux;
mod queue;
pub mod redirector;
pub mod resolve;
pub mod shadowsocks;
pub mod simplesocks;
pub mod socks;
pub mod tls;
pub mod transport;
pub mod trojan;
pub mod websocket;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use trident_proto::{Address, Metadata, ProtoError};

/// Marker for streams a tunnel layer can carry.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Boxed tunnel stream.
pub type BoxStream = Box<dyn TunnelStream>;

/// Errors produced by tunnel layers.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("protocol: {0}")]
    Proto(#[from] ProtoError),
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("layer closed")]
    Closed,
    #[error("{0} not supported by this layer")]
    NotSupported(&'static str),
    #[error("address blocked by router: {0}")]
    Blocked(Address),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// True when the error is the normal end of a flow rather than a fault.
    pub fn is_clean_close(&self) -> bool {
        match self {
            TunnelError::Closed => true,
            TunnelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Hook an entry adapter attaches to a connection when its protocol reply
/// must wait for the outbound dial: SOCKS5 reports the real reply code
/// only once the destination is known reachable (or not).
///
/// The relay engine resolves the hook exactly once, through
/// [`StreamConn::dial_ready`] or [`StreamConn::dial_failed`].
#[async_trait]
pub trait DialAck: Send {
    /// The outbound leg is up; put the success reply on the wire.
    async fn success(&mut self, stream: &mut BoxStream) -> std::io::Result<()>;

    /// The dial failed; report it. The connection closes afterwards.
    async fn failure(&mut self, stream: &mut BoxStream, error: &TunnelError)
        -> std::io::Result<()>;
}

/// An accepted or dialed tunnel connection: an ordered byte stream plus the
/// metadata decoded for (or handed to) the layer above.
pub struct StreamConn {
    stream: BoxStream,
    metadata: Metadata,
    dial_ack: Option<Box<dyn DialAck>>,
}

impl StreamConn {
    pub fn new(stream: impl TunnelStream + 'static, metadata: Metadata) -> Self {
        Self {
            stream: Box::new(stream),
            metadata,
            dial_ack: None,
        }
    }

    pub fn from_boxed(stream: BoxStream, metadata: Metadata) -> Self {
        Self {
            stream,
            metadata,
            dial_ack: None,
        }
    }

    /// A connection whose entry-protocol reply is deferred until the relay
    /// reports the outbound dial outcome.
    pub fn with_dial_ack(stream: BoxStream, metadata: Metadata, ack: Box<dyn DialAck>) -> Self {
        Self {
            stream,
            metadata,
            dial_ack: Some(ack),
        }
    }

    /// The routing header decoded when this connection was accepted, or the
    /// destination it was dialed for.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The outbound dial succeeded: flush the deferred entry reply, if any.
    pub async fn dial_ready(&mut self) -> std::io::Result<()> {
        match self.dial_ack.take() {
            Some(mut ack) => ack.success(&mut self.stream).await,
            None => Ok(()),
        }
    }

    /// The outbound dial failed: report it to the entry peer and drop the
    /// connection.
    pub async fn dial_failed(mut self, error: &TunnelError) {
        if let Some(mut ack) = self.dial_ack.take() {
            let _ = ack.failure(&mut self.stream, error).await;
        }
    }

    pub fn into_parts(self) -> (BoxStream, Metadata) {
        (self.stream, self.metadata)
    }
}

impl std::fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A datagram endpoint whose reads and writes carry per-datagram addresses.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and source (on
    /// the local side) or destination (on the tunnel side) address.
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError>;

    /// Send one datagram toward `addr`.
    async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, TunnelError>;
}

/// Boxed packet connection.
pub type BoxPacketConn = Box<dyn PacketConn>;

/// Server capability: accept inbound flows from the layer below and produce
/// decoded destinations plus streams for the layer above.
#[async_trait]
pub trait TunnelServer: Send + Sync {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError>;

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError>;

    /// Shut this layer down; a layer closes the one below it. Idempotent.
    fn close(&self);
}

/// Client capability: open outbound flows carrying an upper-layer
/// destination. A layer may ignore the destination when its own semantics
/// encode it differently (TLS does; trojan does not).
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError>;

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError>;

    /// Shut this layer down; a layer closes the one below it. Idempotent.
    fn close(&self);
}
