//! Fixed-destination local entry, used by the forward and nat run modes.
//!
//! Every accepted TCP connection and every local UDP peer is surfaced as a
//! flow toward the configured remote destination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::defaults::{ACCEPT_QUEUE_SIZE, MAX_PACKET_SIZE};
use trident_proto::{Address, Metadata};

use crate::queue::recv_or_closed;
use crate::resolve::resolve_endpoint;
use crate::transport::{TcpOptions, TransportServer};
use crate::{BoxPacketConn, PacketConn, StreamConn, TunnelError, TunnelServer};

/// Entry server that stamps every flow with one fixed target.
pub struct ForwardServer {
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    packets: Mutex<mpsc::Receiver<BoxPacketConn>>,
    shutdown: CancellationToken,
}

impl ForwardServer {
    pub async fn bind(
        endpoint: &str,
        target: Address,
        opts: TcpOptions,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let shutdown = parent.child_token();
        let listener = TransportServer::bind(endpoint, opts, shutdown.child_token()).await?;
        let udp = UdpSocket::bind(resolve_endpoint(endpoint, true).await?).await?;

        let (stream_tx, stream_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let server = Arc::new(Self {
            streams: Mutex::new(stream_rx),
            packets: Mutex::new(packet_rx),
            shutdown: shutdown.clone(),
        });

        // TCP accept loop.
        {
            let target = target.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let conn = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = listener.accept_stream() => match result {
                            Ok(conn) => conn,
                            Err(TunnelError::Closed) => break,
                            Err(e) => {
                                warn!(error = %e, "forward accept failed");
                                continue;
                            }
                        },
                    };
                    let (stream, _) = conn.into_parts();
                    let metadata = Metadata::connect(target.clone());
                    if stream_tx
                        .send(StreamConn::from_boxed(stream, metadata))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                debug!("forward tcp loop exiting");
            });
        }

        // UDP demux loop: one packet conn per local peer.
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let socket = Arc::new(udp);
                let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
                let mut buf = vec![0u8; MAX_PACKET_SIZE];
                loop {
                    let (n, from) = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = socket.recv_from(&mut buf) => match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "forward udp recv failed");
                                continue;
                            }
                        },
                    };

                    let sender = match peers.get(&from) {
                        Some(sender) if !sender.is_closed() => sender.clone(),
                        _ => {
                            let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
                            let conn: BoxPacketConn = Box::new(ForwardPacketConn {
                                socket: socket.clone(),
                                peer: from,
                                target: target.clone(),
                                inbound: Mutex::new(rx),
                                closed: shutdown.child_token(),
                            });
                            if packet_tx.send(conn).await.is_err() {
                                break;
                            }
                            peers.insert(from, tx.clone());
                            tx
                        }
                    };
                    let _ = sender.send(buf[..n].to_vec()).await;
                }
                debug!("forward udp loop exiting");
            });
        }

        Ok(server)
    }
}

#[async_trait]
impl TunnelServer for ForwardServer {
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

/// One local UDP peer's flow toward the fixed target.
struct ForwardPacketConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    target: Address,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: CancellationToken,
}

#[async_trait]
impl PacketConn for ForwardPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError> {
        let mut inbound = self.inbound.lock().await;
        let datagram = tokio::select! {
            _ = self.closed.cancelled() => return Err(TunnelError::Closed),
            datagram = inbound.recv() => datagram.ok_or(TunnelError::Closed)?,
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, self.target.clone()))
    }

    async fn write_to(&self, buf: &[u8], _addr: &Address) -> Result<usize, TunnelError> {
        Ok(self.socket.send_to(buf, self.peer).await?)
    }
}
