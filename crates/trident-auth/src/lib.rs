//! User authentication for the trojan layer.
//!
//! A user is keyed by the lowercase-hex SHA-224 of their password. The
//! authenticator is the single shared lookup the server consults for every
//! stream; per-user traffic counters accumulate lock-free and are drained
//! periodically by the statistics flusher.

mod hash;
mod memory;
mod stats;

pub use hash::sha224_hex;
pub use memory::MemoryAuthenticator;
pub use stats::spawn_stat_flusher;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

/// A registered user and their traffic counters.
#[derive(Debug)]
pub struct User {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
}

impl User {
    pub fn new(hash: String) -> Self {
        Self {
            hash,
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
        }
    }

    /// The 56-character password hash identifying this user.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Charge relayed bytes to this user.
    pub fn add_traffic(&self, sent: u64, recv: u64) {
        self.sent.fetch_add(sent, Ordering::Relaxed);
        self.recv.fetch_add(recv, Ordering::Relaxed);
    }

    /// Current counters as `(sent, recv)`.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }

    /// Reset counters, returning the drained `(sent, recv)` totals.
    pub fn take_traffic(&self) -> (u64, u64) {
        (
            self.sent.swap(0, Ordering::Relaxed),
            self.recv.swap(0, Ordering::Relaxed),
        )
    }
}

/// Lookup interface the trojan server authenticates against.
///
/// Storage backends (memory, SQL, management API) implement this; the
/// in-memory backend ships here and is what the config-driven stack uses.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Look up a user by password hash. `None` means the stream is not
    /// trojan traffic and belongs to the fallback.
    async fn auth_user(&self, hash: &str) -> Option<Arc<User>>;

    /// Snapshot of all registered users, for the statistics flusher.
    async fn users(&self) -> Vec<Arc<User>>;
}
