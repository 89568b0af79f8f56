//! Stack composition and the relay engine.
//!
//! This crate turns a validated configuration into a running proxy: it
//! builds the tunnel stack for the configured role, couples source
//! acceptors to the sink client, and owns the supporting pieces the
//! binary needs (share-URL parsing, logging setup).

pub mod logging;
pub mod proxy;
pub mod url;

pub use proxy::{Proxy, build_proxy};
