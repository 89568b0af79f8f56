//! Default configuration values.
//!
//! Centralized constants so every crate agrees on timeouts and sizes.

/// Default TCP relay idle timeout in seconds.
pub const DEFAULT_TCP_TIMEOUT_SECS: u64 = 600;
/// Default UDP association idle timeout in seconds.
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 60;
/// Default mux idle-session reap interval in seconds.
pub const DEFAULT_MUX_IDLE_TIMEOUT_SECS: u64 = 60;
/// Default mux logical-stream concurrency per session.
pub const DEFAULT_MUX_CONCURRENCY: usize = 8;
/// Default statistics flush interval in seconds.
pub const DEFAULT_STAT_FLUSH_SECS: u64 = 30;
/// Default TLS handshake timeout in seconds.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Maximum UDP payload carried in a single tunnel packet (8 KiB).
pub const MAX_PACKET_SIZE: usize = 8 * 1024;
/// Default relay copy buffer size.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32 * 1024;
/// Maximum bytes buffered while waiting for a complete protocol header.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Accept queue capacity between a demultiplexing layer and the relay.
pub const ACCEPT_QUEUE_SIZE: usize = 32;
/// Redirection request queue capacity.
pub const REDIRECT_QUEUE_SIZE: usize = 64;

/// Default TCP_NODELAY.
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default TCP keepalive interval in seconds (0 = disabled).
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 300;
