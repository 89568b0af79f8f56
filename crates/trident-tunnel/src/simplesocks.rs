//! SimpleSocks: the framing used inside mux sessions.
//!
//! The outer mux stream already rode an authenticated trojan connection,
//! so logical streams carry only `Command | Address`: no hash, no CRLF.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::PrefixedStream;
use trident_core::defaults::{ACCEPT_QUEUE_SIZE, DEFAULT_MAX_HEADER_BYTES};
use trident_proto::simplesocks::{parse_header, write_header};
use trident_proto::{Address, Command, Metadata, ParseResult};

use crate::header::HeaderStream;
use crate::mux::{MuxAcceptor, MuxConnector, MuxStream};
use crate::queue::recv_or_closed;
use crate::trojan::TrojanPacketConn;
use crate::{BoxPacketConn, BoxStream, StreamConn, TunnelClient, TunnelError, TunnelServer};

// ── client ──

/// SimpleSocks client: prefixes each logical mux stream with its header.
pub struct SimpleSocksClient {
    inner: Arc<MuxConnector>,
    shutdown: CancellationToken,
}

impl SimpleSocksClient {
    pub fn new(inner: Arc<MuxConnector>, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            inner,
            shutdown: parent.child_token(),
        })
    }

    async fn dial_with_command(
        &self,
        command: Command,
        addr: &Address,
    ) -> Result<(BoxStream, Metadata), TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let logical = self.inner.open_stream().await?;
        let metadata = Metadata {
            command,
            address: addr.clone(),
        };
        let mut header = BytesMut::with_capacity(64);
        write_header(&mut header, &metadata);
        let stream: BoxStream = Box::new(HeaderStream::new(header, logical));
        Ok((stream, metadata))
    }
}

#[async_trait]
impl TunnelClient for SimpleSocksClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        let (stream, metadata) = self.dial_with_command(Command::Connect, addr).await?;
        Ok(StreamConn::from_boxed(stream, metadata))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        let placeholder = Address::from_ip([0, 0, 0, 0].into(), 0);
        let (stream, _) = self
            .dial_with_command(Command::UdpAssociate, &placeholder)
            .await?;
        Ok(Box::new(TrojanPacketConn::new(stream)))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

// ── server ──

/// SimpleSocks server: decodes the header of each inbound logical stream.
pub struct SimpleSocksServer {
    inner: Arc<MuxAcceptor>,
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    packets: Mutex<mpsc::Receiver<BoxPacketConn>>,
    shutdown: CancellationToken,
}

impl SimpleSocksServer {
    pub fn new(inner: Arc<MuxAcceptor>, parent: &CancellationToken) -> Arc<Self> {
        let shutdown = parent.child_token();
        let (stream_tx, stream_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let server = Arc::new(Self {
            inner: inner.clone(),
            streams: Mutex::new(stream_rx),
            packets: Mutex::new(packet_rx),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(async move {
            loop {
                let logical = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = inner.accept_logical() => match result {
                        Ok(logical) => logical,
                        Err(TunnelError::Closed) => break,
                        Err(e) => {
                            warn!(error = %e, "simplesocks failed to accept logical stream");
                            continue;
                        }
                    },
                };
                let stream_tx = stream_tx.clone();
                let packet_tx = packet_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_logical(logical, stream_tx, packet_tx).await {
                        debug!(error = %e, "simplesocks stream rejected");
                    }
                });
            }
            debug!("simplesocks accept loop exiting");
        });

        server
    }
}

async fn handle_logical(
    mut logical: MuxStream,
    stream_tx: mpsc::Sender<StreamConn>,
    packet_tx: mpsc::Sender<BoxPacketConn>,
) -> Result<(), TunnelError> {
    let mut buf = BytesMut::with_capacity(64);
    let metadata = loop {
        match parse_header(&buf) {
            ParseResult::Complete((metadata, consumed)) => {
                bytes::Buf::advance(&mut buf, consumed);
                break metadata;
            }
            ParseResult::Invalid(e) => return Err(TunnelError::Proto(e)),
            ParseResult::Incomplete(_) => {
                if buf.len() > DEFAULT_MAX_HEADER_BYTES {
                    return Err(TunnelError::Handshake("oversized header".into()));
                }
            }
        }
        let n = logical.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(TunnelError::Closed);
        }
    };

    let stream: BoxStream = Box::new(PrefixedStream::new(buf.freeze(), logical));
    match metadata.command {
        Command::Connect => {
            let _ = stream_tx.send(StreamConn::from_boxed(stream, metadata)).await;
        }
        Command::UdpAssociate => {
            let conn: BoxPacketConn = Box::new(TrojanPacketConn::new(stream));
            let _ = packet_tx.send(conn).await;
        }
        Command::Mux => {
            // Nested mux is not a thing; drop the stream.
            return Err(TunnelError::Proto(trident_proto::ProtoError::InvalidCommand));
        }
    }
    Ok(())
}

#[async_trait]
impl TunnelServer for SimpleSocksServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        recv_or_closed(&self.streams, &self.shutdown).await
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        recv_or_closed(&self.packets, &self.shutdown).await
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}
