//! # trident
//!
//! A Trojan-protocol tunnel stack: a TLS-camouflaged forward proxy client
//! and server built from composable tunnel layers.
//!
//! ## Crates
//!
//! - [`trident_core`] - I/O primitives and defaults
//! - [`trident_proto`] - Trojan and SimpleSocks wire codecs
//! - [`trident_auth`] - Password hashing and authentication
//! - [`trident_config`] - Configuration loading and validation
//! - [`trident_metrics`] - Prometheus-compatible metrics
//! - [`trident_tunnel`] - The tunnel layer stack
//! - [`trident_router`] - The client-side policy router
//! - [`trident_proxy`] - Stack composition and the relay engine
//!
//! This crate is the command-line entry point.

pub use trident_auth as auth;
pub use trident_config as config;
pub use trident_core as core;
pub use trident_metrics as metrics;
pub use trident_proto as proto;
pub use trident_proxy as proxy;
pub use trident_router as router;
pub use trident_tunnel as tunnel;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use trident_auth::{Authenticator, MemoryAuthenticator, sha224_hex};
    pub use trident_config::{Config, load_config, validate_config};
    pub use trident_proxy::{Proxy, build_proxy};
}
