//! Async I/O building blocks: the relay engine and stream adapters.

mod prefixed;
mod relay;

pub use prefixed::PrefixedStream;
pub use relay::{NoTraffic, RelayStats, Traffic, relay_stream};
