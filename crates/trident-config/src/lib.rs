//! Configuration loading and validation.
//!
//! The file format mirrors the deployed trojan configuration surface: YAML
//! or JSON, detected by file suffix (or selected explicitly when reading
//! standard input). Unknown `run_type` values, missing certificates and
//! other startup problems are configuration errors: they fail fast and are
//! never recovered in-process.

mod defaults;
mod loader;
mod types;
mod validate;

pub use loader::{StdinFormat, load_config, load_stdin};
pub use types::*;
pub use validate::validate_config;

/// Configuration error: fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("unsupported config extension {0:?} (expected .json, .yaml or .yml)")]
    UnknownExtension(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
