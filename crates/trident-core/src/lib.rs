//! Core I/O primitives shared across trident crates.
//!
//! This crate provides:
//! - Default configuration values
//! - The bidirectional relay engine used by every stream-coupling component
//! - A prefix-replay stream adapter for protocol detection and redirection

pub mod defaults;
pub mod io;

pub use io::{NoTraffic, PrefixedStream, RelayStats, Traffic, relay_stream};

/// Project name.
pub const PROJECT_NAME: &str = "trident";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
