//! Redirection worker.
//!
//! Streams that fail TLS or trojan authentication are piped, bytes already
//! read included, to the decoy origin so an active prober only ever sees a
//! plausible web site. Requests flow through a bounded queue to one worker;
//! a full queue drops (closes) the new inbound rather than blocking the
//! accept path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trident_core::defaults::{DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_TCP_TIMEOUT_SECS, REDIRECT_QUEUE_SIZE};
use trident_core::{NoTraffic, relay_stream};
use trident_metrics::{record_redirection, record_redirection_dropped};

use crate::BoxStream;

/// Custom dial function; the default dials plain TCP.
pub type DialFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>
        + Send
        + Sync,
>;

/// One redirection request: an already-accepted inbound stream (with any
/// consumed bytes replayed in front) and the decoy endpoint to couple it to.
pub struct Redirection {
    pub inbound: BoxStream,
    pub target: String,
    pub dial: Option<DialFn>,
}

/// Shared handle to the redirection worker.
#[derive(Clone)]
pub struct Redirector {
    tx: mpsc::Sender<Redirection>,
}

impl Redirector {
    /// Spawn the worker; it runs until `shutdown` fires.
    pub fn new(shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Redirection>(REDIRECT_QUEUE_SIZE);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("redirector exiting");
                        return;
                    }
                    request = rx.recv() => {
                        let Some(request) = request else { return };
                        tokio::spawn(handle(request));
                    }
                }
            }
        });
        Self { tx }
    }

    /// Submit a redirection. A full queue closes the inbound immediately.
    pub fn submit(&self, redirection: Redirection) {
        match self.tx.try_send(redirection) {
            Ok(()) => record_redirection(),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                record_redirection_dropped();
                debug!(target = %dropped.target, "redirection queue full, dropping inbound");
                drop(dropped);
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                debug!("redirector closed, dropping inbound");
                drop(dropped);
            }
        }
    }
}

async fn handle(request: Redirection) {
    let Redirection {
        inbound,
        target,
        dial,
    } = request;

    debug!(target = %target, "redirecting connection");
    let outbound = match dial {
        Some(dial) => dial(target.clone()).await,
        None => TcpStream::connect(&target).await,
    };
    let outbound = match outbound {
        Ok(conn) => conn,
        Err(e) => {
            debug!(target = %target, error = %e, "failed to dial redirection target");
            return;
        }
    };

    let result = relay_stream(
        inbound,
        outbound,
        Duration::from_secs(DEFAULT_TCP_TIMEOUT_SECS),
        DEFAULT_RELAY_BUFFER_SIZE,
        &NoTraffic,
    )
    .await;

    match result {
        Ok(stats) => debug!(target = %target, bytes = stats.total(), "redirection done"),
        Err(e) => debug!(target = %target, error = %e, "redirection done with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pipes_replayed_bytes_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(shutdown.clone());

        let (mut probe, inbound) = duplex(1024);
        redirector.submit(Redirection {
            inbound: Box::new(inbound),
            target,
            dial: None,
        });

        // The decoy origin sees the probe bytes and answers.
        let (mut origin, _) = listener.accept().await.unwrap();
        probe.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 18];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

        origin.write_all(b"decoy page").await.unwrap();
        drop(origin);

        let mut page = Vec::new();
        probe.read_to_end(&mut page).await.unwrap();
        assert_eq!(page, b"decoy page");

        shutdown.cancel();
    }
}
