//! Local-entry adapter: one listener serving both SOCKS5 and HTTP.
//!
//! The first byte of a SOCKS5 greeting is always `0x05`, which no HTTP
//! method starts with, so a single peeked byte picks the protocol and is
//! replayed to the chosen handler.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::PrefixedStream;
use trident_core::defaults::ACCEPT_QUEUE_SIZE;

use crate::queue::recv_or_closed;
use crate::transport::{TcpOptions, TransportServer};
use crate::{BoxPacketConn, StreamConn, TunnelError, TunnelServer, http, socks};

/// Combined SOCKS5 + HTTP entry server.
pub struct Adapter {
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    packets: Mutex<mpsc::Receiver<BoxPacketConn>>,
    local_addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl Adapter {
    /// Bind `endpoint` and start serving local clients.
    pub async fn bind(
        endpoint: &str,
        opts: TcpOptions,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let shutdown = parent.child_token();
        let listener = TransportServer::bind(endpoint, opts, shutdown.child_token()).await?;
        let local_addr = listener.local_addr()?;
        let local_ip: IpAddr = local_addr.ip();

        let (stream_tx, stream_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let adapter = Arc::new(Self {
            streams: Mutex::new(stream_rx),
            packets: Mutex::new(packet_rx),
            local_addr,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept_stream() => match result {
                        Ok(conn) => conn,
                        Err(TunnelError::Closed) => break,
                        Err(e) => {
                            warn!(error = %e, "adapter accept failed");
                            continue;
                        }
                    },
                };

                let stream_tx = stream_tx.clone();
                let packet_tx = packet_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let (mut stream, _) = conn.into_parts();
                    let mut first = [0u8; 1];
                    match stream.read_exact(&mut first).await {
                        Ok(_) => {}
                        Err(_) => return,
                    }
                    let replayed =
                        PrefixedStream::new(Bytes::copy_from_slice(&first), stream);

                    let result = if first[0] == 0x05 {
                        socks::handle_conn(replayed, local_ip, stream_tx, packet_tx, shutdown)
                            .await
                    } else {
                        http::handle_conn(replayed, stream_tx, shutdown).await
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "local entry connection failed");
                    }
                });
            }
            debug!("adapter accept loop exiting");
        });

        Ok(adapter)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl TunnelServer for Adapter {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        recv_or_closed(&self.streams, &self.shutdown).await
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        recv_or_closed(&self.packets, &self.shutdown).await
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}
