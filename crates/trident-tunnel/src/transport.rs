//! Raw TCP transport: the leaf of every stack.

use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_proto::{Address, Metadata};

use crate::resolve::resolve_endpoint;
use crate::{BoxPacketConn, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// TCP socket options applied to every accepted and dialed stream.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub no_delay: bool,
    /// Keepalive interval in seconds; 0 disables.
    pub keepalive_secs: u64,
    /// Prefer IPv4 when resolving names.
    pub prefer_ipv4: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            no_delay: trident_core::defaults::DEFAULT_TCP_NO_DELAY,
            keepalive_secs: trident_core::defaults::DEFAULT_TCP_KEEPALIVE_SECS,
            prefer_ipv4: false,
        }
    }
}

impl TcpOptions {
    /// Apply the options to a connected stream.
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.no_delay)?;
        if self.keepalive_secs > 0 {
            let sock = SockRef::from(stream);
            let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(self.keepalive_secs));
            sock.set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

/// Listening side of the transport leaf.
pub struct TransportServer {
    listener: TcpListener,
    opts: TcpOptions,
    shutdown: CancellationToken,
}

impl TransportServer {
    /// Bind the listener on `endpoint`.
    pub async fn bind(
        endpoint: &str,
        opts: TcpOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, TunnelError> {
        let addr = resolve_endpoint(endpoint, true).await?;
        let listener = TcpListener::bind(addr).await?;
        debug!(address = %addr, "transport listening");
        Ok(Self {
            listener,
            opts,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl TunnelServer for TransportServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TunnelError::Closed),
            result = self.listener.accept() => {
                let (tcp, peer) = result?;
                if let Err(e) = self.opts.apply(&tcp) {
                    debug!(peer = %peer, error = %e, "failed to apply socket options");
                }
                let metadata = Metadata::connect(Address::from_socket(peer));
                Ok(StreamConn::new(tcp, metadata))
            }
        }
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Dialing side of the transport leaf. Always connects to the configured
/// remote endpoint; the upper-layer destination rides inside the tunnel.
pub struct TransportClient {
    remote: String,
    opts: TcpOptions,
    shutdown: CancellationToken,
}

impl TransportClient {
    pub fn new(remote: impl Into<String>, opts: TcpOptions, shutdown: CancellationToken) -> Self {
        Self {
            remote: remote.into(),
            opts,
            shutdown,
        }
    }
}

#[async_trait]
impl TunnelClient for TransportClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let remote = resolve_endpoint(&self.remote, self.opts.prefer_ipv4).await?;
        let tcp = TcpStream::connect(remote).await?;
        self.opts.apply(&tcp)?;
        debug!(remote = %remote, "transport connected");
        Ok(StreamConn::new(tcp, Metadata::connect(addr.clone())))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn accept_and_dial_roundtrip() {
        let shutdown = CancellationToken::new();
        let server = TransportServer::bind("127.0.0.1:0", TcpOptions::default(), shutdown.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client = TransportClient::new(
            addr.to_string(),
            TcpOptions::default(),
            shutdown.clone(),
        );
        let target = Address::domain("example.com", 80).unwrap();

        let (dialed, accepted) =
            tokio::join!(client.dial_stream(&target), server.accept_stream());
        let mut dialed = dialed.unwrap();
        let mut accepted = accepted.unwrap();
        assert_eq!(dialed.metadata().address, target);

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let shutdown = CancellationToken::new();
        let server = TransportServer::bind("127.0.0.1:0", TcpOptions::default(), shutdown)
            .await
            .unwrap();
        server.close();
        server.close(); // idempotent
        assert!(matches!(
            server.accept_stream().await,
            Err(TunnelError::Closed)
        ));
    }
}
