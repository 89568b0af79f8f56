//! WebSocket layer: HTTP/1.1 Upgrade framing for CDN-friendly transport.
//!
//! The client sends an Upgrade with the configured Host and Path and
//! frames tunnel bytes as binary messages. The server upgrades requests
//! that hit the configured path; anything else is forwarded to the
//! redirection endpoint so the decoy web server answers an ordinary HTTP
//! request.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, client_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::PrefixedStream;
use trident_core::defaults::ACCEPT_QUEUE_SIZE;
use trident_proto::Address;

use crate::http::read_head;
use crate::queue::recv_or_closed;
use crate::redirector::{Redirection, Redirector};
use crate::{BoxPacketConn, BoxStream, StreamConn, TunnelClient, TunnelError, TunnelServer};

/// WebSocket layer settings.
#[derive(Debug, Clone)]
pub struct WebsocketOptions {
    /// Upgrade path, e.g. `/stream`.
    pub path: String,
    /// Host header / request authority.
    pub host: String,
    /// Server only: where non-matching HTTP requests are forwarded.
    pub fallback: Option<String>,
}

// ── stream adapter ──

/// Exposes a WebSocket as `AsyncRead + AsyncWrite` over binary frames.
/// Ping frames are answered in place, close frames surface as EOF.
pub struct WsIo<S> {
    ws: WebSocketStream<S>,
    readable: Bytes,
}

impl<S> WsIo<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            readable: Bytes::new(),
        }
    }

    fn serve_buffered(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.readable.len().min(buf.remaining());
        buf.put_slice(&self.readable[..n]);
        self.readable = self.readable.slice(n..);
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.readable.is_empty() {
            self.serve_buffered(buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => {
                        self.readable = Bytes::from(data);
                        self.serve_buffered(buf);
                        return Poll::Ready(Ok(()));
                    }
                    Message::Text(text) => {
                        self.readable = Bytes::from(text.into_bytes());
                        self.serve_buffered(buf);
                        return Poll::Ready(Ok(()));
                    }
                    Message::Ping(payload) => {
                        let mut ws = Pin::new(&mut self.ws);
                        match ws.as_mut().poll_ready(cx) {
                            Poll::Ready(Ok(())) => {
                                if let Err(e) = ws.start_send(Message::Pong(payload)) {
                                    return Poll::Ready(Err(ws_err(e)));
                                }
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_err(e))),
                            // Skip the pong rather than stall the read path.
                            Poll::Pending => {}
                        }
                    }
                    Message::Pong(_) | Message::Frame(_) => {}
                    Message::Close(_) => return Poll::Ready(Ok(())),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut ws = Pin::new(&mut self.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                if let Err(e) = ws.start_send(Message::Binary(data.to_vec())) {
                    return Poll::Ready(Err(ws_err(e)));
                }
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_err(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.ws).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.ws).poll_close(cx).map_err(ws_err)
    }
}

fn ws_err(e: WsError) -> std::io::Error {
    std::io::Error::other(e)
}

// ── client ──

/// WebSocket client layer.
pub struct WebsocketClient {
    inner: Arc<dyn TunnelClient>,
    url: String,
    shutdown: CancellationToken,
}

impl WebsocketClient {
    pub fn new(
        inner: Arc<dyn TunnelClient>,
        opts: WebsocketOptions,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            url: format!("ws://{}{}", opts.host, opts.path),
            shutdown: parent.child_token(),
        })
    }
}

#[async_trait]
impl TunnelClient for WebsocketClient {
    async fn dial_stream(&self, addr: &Address) -> Result<StreamConn, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let (stream, metadata) = self.inner.dial_stream(addr).await?.into_parts();
        let (ws, _response) = client_async(&self.url, stream)
            .await
            .map_err(|e| TunnelError::Handshake(format!("websocket upgrade failed: {e}")))?;
        Ok(StreamConn::new(WsIo::new(ws), metadata))
    }

    async fn dial_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

// ── server ──

/// WebSocket server layer.
pub struct WebsocketServer {
    inner: Arc<dyn TunnelServer>,
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    shutdown: CancellationToken,
}

impl WebsocketServer {
    pub fn new(
        inner: Arc<dyn TunnelServer>,
        opts: WebsocketOptions,
        redirector: Redirector,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let shutdown = parent.child_token();
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let server = Arc::new(Self {
            inner: inner.clone(),
            streams: Mutex::new(rx),
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
                            warn!(error = %e, "websocket failed to accept from underlying layer");
                            continue;
                        }
                    },
                };
                let opts = opts.clone();
                let redirector = redirector.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = upgrade_conn(conn, opts, redirector, tx).await {
                        debug!(error = %e, "websocket upgrade failed");
                    }
                });
            }
            debug!("websocket accept loop exiting");
        });

        server
    }
}

async fn upgrade_conn(
    conn: StreamConn,
    opts: WebsocketOptions,
    redirector: Redirector,
    tx: mpsc::Sender<StreamConn>,
) -> Result<(), TunnelError> {
    let (mut stream, metadata) = conn.into_parts();
    let mut buf = BytesMut::with_capacity(512);
    let head = read_head(&mut stream, &mut buf).await?;

    let is_upgrade = head
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if !is_upgrade || head.uri != opts.path {
        // An ordinary HTTP request: let the decoy web server answer it.
        debug!(path = %head.uri, "non-websocket request, forwarding");
        if let Some(target) = &opts.fallback {
            redirector.submit(Redirection {
                inbound: Box::new(PrefixedStream::new(buf.freeze(), stream)),
                target: target.clone(),
                dial: None,
            });
        }
        return Ok(());
    }

    // Replay the consumed head so the handshake sees the full request.
    let replayed: BoxStream = Box::new(PrefixedStream::new(buf.freeze(), stream));
    let ws = accept_async(replayed)
        .await
        .map_err(|e| TunnelError::Handshake(format!("websocket accept failed: {e}")))?;
    let _ = tx.send(StreamConn::new(WsIo::new(ws), metadata)).await;
    Ok(())
}

#[async_trait]
impl TunnelServer for WebsocketServer {
    async fn accept_stream(&self) -> Result<StreamConn, TunnelError> {
        recv_or_closed(&self.streams, &self.shutdown).await
    }

    async fn accept_packet(&self) -> Result<BoxPacketConn, TunnelError> {
        Err(TunnelError::NotSupported("packets"))
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn ws_io_roundtrip_over_duplex() {
        let (near, far) = duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let ws = accept_async(far).await.unwrap();
            let mut io = WsIo::new(ws);
            let mut buf = [0u8; 5];
            io.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            io.write_all(b"world").await.unwrap();
            io.flush().await.unwrap();
        });

        let (ws, _) = client_async("ws://example.test/tunnel", near).await.unwrap();
        let mut io = WsIo::new(ws);
        io.write_all(b"hello").await.unwrap();
        io.flush().await.unwrap();
        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.unwrap();
    }
}
