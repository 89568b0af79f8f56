//! Client-side policy router.
//!
//! Chooses, per destination, between proxying through the tunnel, dialing
//! directly, or blocking, driven by domain rules (full / suffix / keyword
//! / regex), CIDR ranges, and bulk geodata tables in the V2Ray `geoip.dat`
//! / `geosite.dat` format.

mod client;
mod geodata;
mod matcher;
mod router;
mod rule;

pub use client::RouterClient;
pub use geodata::GeodataLoader;
pub use router::{Router, RouterBuilder};
pub use rule::{DomainStrategy, Policy, RuleEntry, parse_rule};

/// Router construction and lookup errors. Construction errors are fatal at
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid rule {0:?}: {1}")]
    InvalidRule(String, String),
    #[error("invalid regex {0:?}: {1}")]
    InvalidRegex(String, regex::Error),
    #[error("failed to read geodata {path}: {source}")]
    GeodataRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode geodata {path}: {source}")]
    GeodataDecode {
        path: String,
        source: prost::DecodeError,
    },
    #[error("invalid policy name {0:?}")]
    InvalidPolicy(String),
    #[error("invalid domain strategy {0:?}")]
    InvalidStrategy(String),
}
