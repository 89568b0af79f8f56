//! Accept-queue plumbing shared by demultiplexing layers.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::TunnelError;

/// Receive the next queued item, or fail with [`TunnelError::Closed`] once
/// the layer shuts down.
pub(crate) async fn recv_or_closed<T>(
    rx: &Mutex<mpsc::Receiver<T>>,
    shutdown: &CancellationToken,
) -> Result<T, TunnelError> {
    let mut rx = rx.lock().await;
    tokio::select! {
        _ = shutdown.cancelled() => Err(TunnelError::Closed),
        item = rx.recv() => item.ok_or(TunnelError::Closed),
    }
}
