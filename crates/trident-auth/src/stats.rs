//! Periodic traffic statistics flushing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Authenticator;

/// Spawn the statistics flusher: every `interval` it drains each user's
/// traffic counters and reports non-zero deltas. Counters are not
/// persisted; the log line is the export surface.
pub fn spawn_stat_flusher(
    auth: Arc<dyn Authenticator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("stat flusher exiting");
                    return;
                }
                _ = ticker.tick() => {
                    for user in auth.users().await {
                        let (sent, recv) = user.take_traffic();
                        if sent > 0 || recv > 0 {
                            debug!(user = %user.hash(), sent, recv, "traffic flushed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryAuthenticator, sha224_hex};

    #[tokio::test(start_paused = true)]
    async fn flusher_drains_counters() {
        let auth = Arc::new(MemoryAuthenticator::from_passwords(["p"]));
        let user = auth.auth_user(&sha224_hex("p")).await.unwrap();
        user.add_traffic(10, 20);

        let shutdown = CancellationToken::new();
        let handle = spawn_stat_flusher(auth.clone(), Duration::from_secs(30), shutdown.clone());

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(user.traffic(), (0, 0));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
