//! Trojan layer: hash authentication, request framing and the anti-probing
//! fallback.
//!
//! The server reads the fixed-size hash field without scanning, then
//! requires CRLF, a known command, a well-formed address and a second CRLF.
//! Any deviation (short read, non-hex hash, missing CRLF, unknown hash)
//! sends the connection to the redirector with all buffered bytes replayed,
//! so the peer observes exactly what the decoy origin would have answered.
//! No error is ever written back and the connection is never reset early.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_auth::{Authenticator, User};
use trident_core::PrefixedStream;
use trident_core::defaults::{ACCEPT_QUEUE_SIZE, DEFAULT_MAX_HEADER_BYTES};
use trident_metrics::{record_auth_failure, record_auth_success};
use trident_proto::trojan::{parse_udp_packet, parse_request, write_request, write_udp_packet};
use trident_proto::{Address, Command, Metadata, ParseResult};

use crate::header::HeaderStream;
use crate::queue::recv_or_closed;
use crate::redirector::{Redirection, Redirector};
use crate::{BoxPacketConn, BoxStream, PacketConn, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// Trojan server settings.
#[derive(Debug, Clone)]
pub struct TrojanServerOptions {
    /// Decoy endpoint unauthenticated streams are piped to.
    pub fallback: Option<String>,
    /// Redirect once a header grows past this without parsing.
    pub max_header_bytes: usize,
}

impl Default for TrojanServerOptions {
    fn default() -> Self {
        Self {
            fallback: None,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

// ── traffic accounting ──

/// Stream wrapper charging relayed bytes to the authenticated user.
struct MeteredStream<S> {
    inner: S,
    user: Arc<User>,
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.user.add_traffic(0, n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let result = std::pin::Pin::new(&mut self.inner).poll_write(cx, data);
        if let std::task::Poll::Ready(Ok(n)) = &result {
            self.user.add_traffic(*n as u64, 0);
        }
        result
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── packet connection ──

struct PacketReadHalf {
    half: ReadHalf<BoxStream>,
    buf: BytesMut,
}

/// Datagram endpoint over an authenticated trojan stream: each datagram is
/// framed as `Address | Length | CRLF | data`.
pub struct TrojanPacketConn {
    read: Mutex<PacketReadHalf>,
    write: Mutex<WriteHalf<BoxStream>>,
}

impl TrojanPacketConn {
    pub fn new(stream: BoxStream) -> Self {
        Self::with_initial(stream, BytesMut::new())
    }

    /// Wrap a stream whose first frame bytes were already buffered.
    pub fn with_initial(stream: BoxStream, initial: BytesMut) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Mutex::new(PacketReadHalf {
                half: read,
                buf: initial,
            }),
            write: Mutex::new(write),
        }
    }
}

#[async_trait]
impl PacketConn for TrojanPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address), TunnelError> {
        let mut read = self.read.lock().await;
        loop {
            match parse_udp_packet(&read.buf) {
                ParseResult::Complete(pkt) => {
                    let n = pkt.payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&pkt.payload[..n]);
                    let address = pkt.address;
                    let consumed = pkt.packet_len;
                    read.buf.advance(consumed);
                    return Ok((n, address));
                }
                // Oversized or malformed frames are fatal after auth.
                ParseResult::Invalid(e) => return Err(TunnelError::Proto(e)),
                ParseResult::Incomplete(_) => {}
            }
            let read = &mut *read;
            let n = read.half.read_buf(&mut read.buf).await?;
            if n == 0 {
                return Err(TunnelError::Closed);
            }
        }
    }

    async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, TunnelError> {
        let mut frame = BytesMut::with_capacity(buf.len() + 64);
        write_udp_packet(&mut frame, addr, buf)?;
        let mut write = self.write.lock().await;
        write.write_all(&frame).await?;
        write.flush().await?;
        Ok(buf.len())
    }
}

// ── server ──

/// Trojan server layer.
pub struct TrojanServer {
    inner: Arc<dyn TunnelServer>,
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    packets: Mutex<mpsc::Receiver<BoxPacketConn>>,
    mux_streams: Mutex<mpsc::Receiver<StreamConn>>,
    shutdown: CancellationToken,
}

impl TrojanServer {
    /// Build over `inner` and start the accept loop; each connection's
    /// header is parsed in its own task.
    pub fn new(
        inner: Arc<dyn TunnelServer>,
        auth: Arc<dyn Authenticator>,
        redirector: Redirector,
        opts: TrojanServerOptions,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let shutdown = parent.child_token();
        let (stream_tx, stream_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (mux_tx, mux_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let server = Arc::new(Self {
            inner: inner.clone(),
            streams: Mutex::new(stream_rx),
            packets: Mutex::new(packet_rx),
            mux_streams: Mutex::new(mux_rx),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = inner.accept_stream() => match result {
                        Ok(conn) => conn,
                        Err(TunnelError::Closed) => break,
                        Err(e) => {
                            if shutdown.is_cancelled() {
                                break;
                            }
                            warn!(error = %e, "trojan failed to accept from underlying layer");
                            continue;
                        }
                    },
                };

                let auth = auth.clone();
                let redirector = redirector.clone();
                let opts = opts.clone();
                let stream_tx = stream_tx.clone();
                let packet_tx = packet_tx.clone();
                let mux_tx = mux_tx.clone();
                tokio::spawn(async move {
                    handle_conn(conn, auth, redirector, opts, stream_tx, packet_tx, mux_tx).await;
                });
            }
            debug!("trojan accept loop exiting");
        });

        server
    }

    /// Accept a stream that carries a mux session (the `0x7f` command).
    /// Consumed by the mux acceptor stacked above this server.
    pub async fn accept_mux_stream(&self) -> Result<StreamConn, TunnelError> {
        recv_or_closed(&self.mux_streams, &self.shutdown).await
    }
}

async fn handle_conn(
    conn: StreamConn,
    auth: Arc<dyn Authenticator>,
    redirector: Redirector,
    opts: TrojanServerOptions,
    stream_tx: mpsc::Sender<StreamConn>,
    packet_tx: mpsc::Sender<BoxPacketConn>,
    mux_tx: mpsc::Sender<StreamConn>,
) {
    let (mut stream, peer_meta) = conn.into_parts();
    let peer = peer_meta.address;
    let mut buf = BytesMut::with_capacity(512);

    loop {
        match parse_request(&buf) {
            ParseResult::Complete(request) => {
                let Some(user) = auth.auth_user(request.hash_str()).await else {
                    record_auth_failure();
                    debug!(peer = %peer, "unknown hash, redirecting");
                    redirect(&redirector, &opts, buf, stream);
                    return;
                };
                record_auth_success();
                debug!(peer = %peer, request = %request.metadata, "trojan request");

                let metadata = request.metadata;
                buf.advance(request.header_len);
                let payload = buf;
                let metered: BoxStream = Box::new(MeteredStream {
                    inner: PrefixedStream::new(payload.freeze(), stream),
                    user,
                });

                match metadata.command {
                    Command::Connect => {
                        let _ = stream_tx
                            .send(StreamConn::from_boxed(metered, metadata))
                            .await;
                    }
                    Command::UdpAssociate => {
                        let conn: BoxPacketConn = Box::new(TrojanPacketConn::new(metered));
                        let _ = packet_tx.send(conn).await;
                    }
                    Command::Mux => {
                        let _ = mux_tx.send(StreamConn::from_boxed(metered, metadata)).await;
                    }
                }
                return;
            }
            ParseResult::Invalid(e) => {
                record_auth_failure();
                debug!(peer = %peer, error = %e, "invalid trojan header, redirecting");
                redirect(&redirector, &opts, buf, stream);
                return;
            }
            ParseResult::Incomplete(_) => {
                if buf.len() > opts.max_header_bytes {
                    record_auth_failure();
                    debug!(peer = %peer, bytes = buf.len(), "header too large, redirecting");
                    redirect(&redirector, &opts, buf, stream);
                    return;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                // EOF before a complete header: replay what little arrived
                // so the decoy still answers the way it would have.
                if !buf.is_empty() {
                    redirect(&redirector, &opts, buf, stream);
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer, error = %e, "read failed before authentication");
                return;
            }
        }
    }
}

fn redirect(redirector: &Redirector, opts: &TrojanServerOptions, buf: BytesMut, stream: BoxStream) {
    let Some(target) = &opts.fallback else {
        // No decoy configured: the stream just closes.
        return;
    };
    redirector.submit(Redirection {
        inbound: Box::new(PrefixedStream::new(buf.freeze(), stream)),
        target: target.clone(),
        dial: None,
    });
}

#[async_trait]
impl TunnelServer for TrojanServer {
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

// ── client ──

/// Trojan client layer.
pub struct TrojanClient {
    inner: Arc<dyn TunnelClient>,
    hash: String,
    shutdown: CancellationToken,
}

impl TrojanClient {
    /// `hash` is the lowercase-hex SHA-224 of the password.
    pub fn new(inner: Arc<dyn TunnelClient>, hash: String, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            inner,
            hash,
            shutdown: parent.child_token(),
        })
    }

    async fn dial_with_command(
        &self,
        command: Command,
        addr: &Address,
    ) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let (stream, _) = self.inner.dial_stream(addr).await?.into_parts();
        let metadata = Metadata {
            command,
            address: addr.clone(),
        };
        let mut header = BytesMut::with_capacity(128);
        write_request(&mut header, &self.hash, &metadata)?;
        Ok(StreamConn::from_boxed(
            Box::new(HeaderStream::new(header, stream)),
            metadata,
        ))
    }

    /// Open a stream carrying a mux session.
    pub async fn dial_mux_stream(&self) -> Result<StreamConn, TunnelError> {
        self.dial_with_command(Command::Mux, &unspecified_address()).await
    }
}

fn unspecified_address() -> Address {
    Address::from_ip([0, 0, 0, 0].into(), 0)
}

#[async_trait]
impl TunnelClient for TrojanClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        self.dial_with_command(Command::Connect, addr).await
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        let conn = self
            .dial_with_command(Command::UdpAssociate, &unspecified_address())
            .await?;
        let (stream, _) = conn.into_parts();
        Ok(Box::new(TrojanPacketConn::new(stream)))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use trident_auth::{MemoryAuthenticator, sha224_hex};

    struct OneShotServer {
        conn: Mutex<Option<StreamConn>>,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl TunnelServer for OneShotServer {
        async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
            if let Some(conn) = self.conn.lock().await.take() {
                return Ok(conn);
            }
            self.shutdown.cancelled().await;
            Err(TunnelError::Closed)
        }

        async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
            Err(TunnelError::NotSupported("packets"))
        }

        fn close(&self) {
            self.shutdown.cancel();
        }
    }

    fn one_shot(stream: impl crate::TunnelStream + 'static) -> Arc<OneShotServer> {
        Arc::new(OneShotServer {
            conn: Mutex::new(Some(StreamConn::new(
                stream,
                Metadata::connect(Address::from_ip([127, 0, 0, 1].into(), 9)),
            ))),
            shutdown: CancellationToken::new(),
        })
    }

    fn server_over(
        stream: impl crate::TunnelStream + 'static,
        fallback: Option<String>,
        root: &CancellationToken,
    ) -> Arc<TrojanServer> {
        let auth = Arc::new(MemoryAuthenticator::from_passwords(["hunter2"]));
        TrojanServer::new(
            one_shot(stream),
            auth,
            Redirector::new(root.child_token()),
            TrojanServerOptions {
                fallback,
                ..TrojanServerOptions::default()
            },
            root,
        )
    }

    #[tokio::test]
    async fn authenticated_connect_surfaces_metadata_and_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let root = CancellationToken::new();
        let (mut client, inbound) = duplex(4096);
        let server = server_over(inbound, None, &root);

        let mut request = BytesMut::new();
        let meta = Metadata::connect(Address::domain("example.com", 80).unwrap());
        write_request(&mut request, &sha224_hex("hunter2"), &meta).unwrap();
        request.extend_from_slice(b"GET /");
        client.write_all(&request).await.unwrap();

        let mut conn = server.accept_stream().await.unwrap();
        assert_eq!(conn.metadata(), &meta);

        let mut payload = [0u8; 5];
        conn.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET /");

        conn.write_all(b"HTTP/1.0 200 OK").await.unwrap();
        let mut reply = [0u8; 15];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.0 200 OK");

        root.cancel();
    }

    #[tokio::test]
    async fn unknown_hash_goes_to_fallback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let root = CancellationToken::new();
        let decoy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fallback = decoy.local_addr().unwrap().to_string();

        let (mut probe, inbound) = duplex(4096);
        let server = server_over(inbound, Some(fallback), &root);

        // Random 57 bytes + CRLF, a classic active probe.
        let mut garbage = vec![b'z'; 57];
        garbage.extend_from_slice(b"\r\n");
        probe.write_all(&garbage).await.unwrap();

        // The decoy sees the probe bytes verbatim and answers.
        let (mut origin, _) = decoy.accept().await.unwrap();
        let mut seen = vec![0u8; garbage.len()];
        origin.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, garbage);
        origin.write_all(b"<html>decoy</html>").await.unwrap();

        let mut page = [0u8; 18];
        probe.read_exact(&mut page).await.unwrap();
        assert_eq!(&page, b"<html>decoy</html>");

        // Nothing ever surfaced to the relay.
        assert!(server.streams.lock().await.try_recv().is_err());
        root.cancel();
    }

    #[tokio::test]
    async fn client_bundles_header_with_first_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        struct OneShotClient {
            stream: Mutex<Option<BoxStream>>,
        }

        #[async_trait]
        impl TunnelClient for OneShotClient {
            async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
                let stream = self.stream.lock().await.take().expect("dialed once");
                Ok(StreamConn::from_boxed(stream, Metadata::connect(addr.clone())))
            }
            async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
                Err(TunnelError::NotSupported("packets"))
            }
            fn close(&self) {}
        }

        let root = CancellationToken::new();
        let (mut remote, local) = duplex(4096);
        let inner = Arc::new(OneShotClient {
            stream: Mutex::new(Some(Box::new(local) as BoxStream)),
        });
        let hash = sha224_hex("hunter2");
        let client = TrojanClient::new(inner, hash.clone(), &root);

        let target = Address::domain("example.com", 80).unwrap();
        let mut conn = client.dial_stream(&target).await.unwrap();
        conn.write_all(b"payload").await.unwrap();
        conn.flush().await.unwrap();

        let mut expected = BytesMut::new();
        write_request(&mut expected, &hash, &Metadata::connect(target)).unwrap();
        expected.extend_from_slice(b"payload");

        let mut seen = vec![0u8; expected.len()];
        remote.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..], &expected[..]);
    }

    #[tokio::test]
    async fn packet_conn_roundtrip() {
        let (near, far) = duplex(4096);
        let a = TrojanPacketConn::new(Box::new(near));
        let b = TrojanPacketConn::new(Box::new(far));

        let addr = Address::from_ip([8, 8, 8, 8].into(), 53);
        a.write_to(b"PING", &addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");
        assert_eq!(from, addr);
    }
}
