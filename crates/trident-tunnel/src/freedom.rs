//! Freedom: the direct dialer.
//!
//! Used as the server's outbound leg and as the router's bypass target.
//! Streams connect straight to the destination; packet connections carry a
//! plain UDP socket whose datagrams resolve their destination per write.

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_proto::{Address, Metadata};

use crate::resolve::resolve_address;
use crate::transport::TcpOptions;
use crate::{BoxPacketConn, PacketConn, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// Direct outbound client.
pub struct FreedomClient {
    opts: TcpOptions,
    shutdown: CancellationToken,
}

impl FreedomClient {
    pub fn new(opts: TcpOptions, parent: &CancellationToken) -> Self {
        Self {
            opts,
            shutdown: parent.child_token(),
        }
    }
}

#[async_trait]
impl TunnelClient for FreedomClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let target = resolve_address(addr, self.opts.prefer_ipv4).await?;
        let tcp = TcpStream::connect(target).await?;
        self.opts.apply(&tcp)?;
        debug!(target = %addr, resolved = %target, "direct connection");
        Ok(StreamConn::new(tcp, Metadata::connect(addr.clone())))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Box::new(FreedomPacketConn {
            socket,
            prefer_ipv4: self.opts.prefer_ipv4,
        }))
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Direct UDP endpoint.
pub struct FreedomPacketConn {
    socket: UdpSocket,
    prefer_ipv4: bool,
}

#[async_trait]
impl PacketConn for FreedomPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, Address::from_socket(from)))
    }

    async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, TunnelError> {
        let target = resolve_address(addr, self.prefer_ipv4).await?;
        Ok(self.socket.send_to(buf, target).await?)
    }
}

/// Accepting is meaningless for freedom; it exists purely as a client.
pub struct FreedomServer;

#[async_trait]
impl TunnelServer for FreedomServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        Err(TunnelError::NotSupported("accepting"))
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("accepting"))
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_direct_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let root = CancellationToken::new();
        let client = FreedomClient::new(TcpOptions::default(), &root);
        let target = Address::from_socket(addr);

        let (conn, accepted) = tokio::join!(client.dial_stream(&target), listener.accept());
        let mut conn = conn.unwrap();
        let (mut origin, _) = accepted.unwrap();

        conn.write_all(b"direct").await.unwrap();
        let mut buf = [0u8; 6];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
    }

    #[tokio::test]
    async fn udp_echo_roundtrip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let root = CancellationToken::new();
        let client = FreedomClient::new(TcpOptions::default(), &root);
        let conn = client.dial_packet().await.unwrap();

        let target = Address::from_socket(echo_addr);
        conn.write_to(b"PING", &target).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = conn.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");
        assert_eq!(from, target);
    }
}
