//! Stream multiplexing over a single tunnel connection.
//!
//! The connector keeps a pool of yamux sessions, each carried by one
//! trojan stream dialed with the mux command. A session serves at most
//! `concurrency` live logical streams; when every session is full a new
//! one is dialed. Sessions with zero live streams are torn down after the
//! idle timeout. Closing a logical stream never closes its session;
//! closing a session resets all of its streams.
//!
//! The acceptor drives one yamux server connection per inbound mux stream
//! and surfaces each logical stream to the SimpleSocks layer above.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use crate::TunnelClient;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trident_core::defaults::ACCEPT_QUEUE_SIZE;

use crate::queue::recv_or_closed;
use crate::trojan::{TrojanClient, TrojanServer};
use crate::{BoxStream, TunnelError};

/// Mux connector settings.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Live logical streams per session before a new session is dialed.
    pub concurrency: usize,
    /// Tear down sessions idle for this long with zero live streams.
    pub idle_timeout: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            concurrency: trident_core::defaults::DEFAULT_MUX_CONCURRENCY,
            idle_timeout: Duration::from_secs(
                trident_core::defaults::DEFAULT_MUX_IDLE_TIMEOUT_SECS,
            ),
        }
    }
}

/// How often the reaper scans for idle sessions.
const REAP_TICK: Duration = Duration::from_secs(5);

type OpenRequest = oneshot::Sender<Result<yamux::Stream, TunnelError>>;

/// State shared between a session's pool entry, its driver task and the
/// live-stream guards.
struct SessionShared {
    live: AtomicUsize,
    idle_since: StdMutex<Option<Instant>>,
    closed: CancellationToken,
}

#[derive(Clone)]
struct MuxSession {
    open_tx: mpsc::Sender<OpenRequest>,
    shared: Arc<SessionShared>,
    id: u64,
}

/// Decrements the session's live count when a logical stream drops.
struct LiveGuard(Arc<SessionShared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.0.idle_since.lock().expect("idle lock") = Some(Instant::now());
        }
    }
}

/// One logical stream inside a mux session.
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    _live: Option<LiveGuard>,
}

impl MuxStream {
    fn client(stream: yamux::Stream, guard: LiveGuard) -> Self {
        Self {
            inner: stream.compat(),
            _live: Some(guard),
        }
    }

    fn server(stream: yamux::Stream) -> Self {
        Self {
            inner: stream.compat(),
            _live: None,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── connector ──

/// Client side: multiplexes logical streams over pooled trojan streams.
pub struct MuxConnector {
    inner: Arc<TrojanClient>,
    opts: MuxOptions,
    sessions: Mutex<Vec<MuxSession>>,
    next_id: AtomicUsize,
    shutdown: CancellationToken,
}

impl MuxConnector {
    pub fn new(inner: Arc<TrojanClient>, opts: MuxOptions, parent: &CancellationToken) -> Arc<Self> {
        let shutdown = parent.child_token();
        let connector = Arc::new(Self {
            inner,
            opts,
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        });

        let reaper = Arc::downgrade(&connector);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(connector) = reaper.upgrade() else { break };
                connector.reap_idle().await;
            }
        });

        connector
    }

    /// Open a new logical stream, reusing a session with spare capacity or
    /// dialing a fresh one.
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }

        // The live count moves under the pool lock: concurrent dials must
        // neither oversubscribe a session nor race the idle reaper.
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|s| !s.shared.closed.is_cancelled());
            let session = match sessions
                .iter()
                .find(|s| s.shared.live.load(Ordering::Acquire) < self.opts.concurrency)
            {
                Some(session) => session.clone(),
                None => {
                    let session = self.new_session().await?;
                    sessions.push(session.clone());
                    session
                }
            };
            session.shared.live.fetch_add(1, Ordering::AcqRel);
            *session.shared.idle_since.lock().expect("idle lock") = None;
            session
        };
        let guard = LiveGuard(session.shared.clone());

        let (tx, rx) = oneshot::channel();
        if session.open_tx.send(tx).await.is_err() {
            return Err(TunnelError::Closed);
        }
        match rx.await {
            Ok(Ok(stream)) => {
                debug!(session = session.id, stream = %stream.id(), "mux stream opened");
                Ok(MuxStream::client(stream, guard))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TunnelError::Closed),
        }
    }

    /// Number of live (non-closed) sessions.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|s| !s.shared.closed.is_cancelled())
            .count()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.inner.close();
    }

    async fn new_session(&self) -> Result<MuxSession, TunnelError> {
        let (stream, _) = self.inner.dial_mux_stream().await?.into_parts();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        debug!(session = id, "mux session dialed");

        let connection =
            yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Client);
        let shared = Arc::new(SessionShared {
            live: AtomicUsize::new(0),
            idle_since: StdMutex::new(Some(Instant::now())),
            closed: self.shutdown.child_token(),
        });
        let (open_tx, open_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        tokio::spawn(drive_client_session(connection, open_rx, shared.clone(), id));

        Ok(MuxSession {
            open_tx,
            shared,
            id,
        })
    }

    async fn reap_idle(&self) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|session| {
            if session.shared.closed.is_cancelled() {
                return false;
            }
            if session.shared.live.load(Ordering::Acquire) == 0 {
                let idle_since = *session.shared.idle_since.lock().expect("idle lock");
                if let Some(since) = idle_since {
                    if since.elapsed() >= self.opts.idle_timeout {
                        debug!(session = session.id, "reaping idle mux session");
                        session.shared.closed.cancel();
                        return false;
                    }
                }
            }
            true
        });
    }
}

/// Drives one client-side yamux connection: opens outbound streams on
/// request and keeps the connection I/O moving.
async fn drive_client_session(
    mut connection: yamux::Connection<Compat<BoxStream>>,
    mut open_rx: mpsc::Receiver<OpenRequest>,
    shared: Arc<SessionShared>,
    id: u64,
) {
    let mut pending: VecDeque<OpenRequest> = VecDeque::new();
    let closed = shared.closed.clone();

    let driver = std::future::poll_fn(move |cx| {
        while let Poll::Ready(request) = open_rx.poll_recv(cx) {
            match request {
                Some(request) => pending.push_back(request),
                None => break,
            }
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(request) = pending.pop_front() {
                        let _ = request.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => {
                    warn!(session = id, error = %e, "mux session failed");
                    for request in pending.drain(..) {
                        let _ = request.send(Err(TunnelError::Io(std::io::Error::other(
                            e.to_string(),
                        ))));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                // The server never opens streams toward us; drain and drop.
                Poll::Ready(Some(Ok(stream))) => drop(stream),
                Poll::Ready(Some(Err(e))) => {
                    debug!(session = id, error = %e, "mux session ended");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!(session = id, "mux session closed by peer");
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        Poll::Pending
    });

    tokio::select! {
        _ = closed.cancelled() => debug!(session = id, "mux session torn down"),
        _ = driver => {}
    }
    shared.closed.cancel();
}

// ── acceptor ──

/// Server side: accepts mux-command streams from the trojan server and
/// surfaces each inbound logical stream.
pub struct MuxAcceptor {
    logical: Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: CancellationToken,
}

impl MuxAcceptor {
    pub fn new(inner: Arc<TrojanServer>, parent: &CancellationToken) -> Arc<Self> {
        let shutdown = parent.child_token();
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);

        let acceptor = Arc::new(Self {
            logical: Mutex::new(rx),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = inner.accept_mux_stream() => match result {
                        Ok(conn) => conn,
                        Err(TunnelError::Closed) => break,
                        Err(e) => {
                            warn!(error = %e, "mux failed to accept session stream");
                            continue;
                        }
                    },
                };
                let (stream, _) = conn.into_parts();
                tokio::spawn(drive_server_session(stream, tx.clone(), shutdown.clone()));
            }
            debug!("mux acceptor exiting");
        });

        acceptor
    }

    /// Accept the next inbound logical stream.
    pub async fn accept_logical(&self) -> Result<MuxStream, TunnelError> {
        recv_or_closed(&self.logical, &self.shutdown).await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn drive_server_session(
    stream: BoxStream,
    tx: mpsc::Sender<MuxStream>,
    shutdown: CancellationToken,
) {
    let mut connection =
        yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Server);
    loop {
        let next = std::future::poll_fn(|cx| connection.poll_next_inbound(cx));
        let inbound = tokio::select! {
            _ = shutdown.cancelled() => break,
            inbound = next => inbound,
        };
        match inbound {
            Some(Ok(stream)) => {
                if tx.send(MuxStream::server(stream)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "mux session error");
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_deployment() {
        let opts = MuxOptions::default();
        assert_eq!(opts.concurrency, 8);
        assert_eq!(opts.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn live_guard_marks_idle_on_last_drop() {
        let shared = Arc::new(SessionShared {
            live: AtomicUsize::new(2),
            idle_since: StdMutex::new(None),
            closed: CancellationToken::new(),
        });
        let a = LiveGuard(shared.clone());
        let b = LiveGuard(shared.clone());
        drop(a);
        assert!(shared.idle_since.lock().unwrap().is_none());
        drop(b);
        assert!(shared.idle_since.lock().unwrap().is_some());
    }

    #[test]
    fn session_cap_arithmetic() {
        // 32 concurrent streams at concurrency 8 never needs more than
        // ceil(32/8) sessions: the pool reuses any session below the cap.
        let concurrency: usize = 8;
        let streams: usize = 32;
        let sessions_needed = streams.div_ceil(concurrency);
        assert_eq!(sessions_needed, 4);
    }
}
