//! Configuration file and stdin loading.

use std::io::Read;
use std::path::Path;

use crate::{Config, ConfigError};

/// Format selector for configuration read from standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinFormat {
    Json,
    Yaml,
}

impl std::str::FromStr for StdinFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(StdinFormat::Json),
            "yaml" | "yml" => Ok(StdinFormat::Yaml),
            other => Err(ConfigError::Invalid(format!(
                "unknown stdin format {other:?} (expected json or yaml)"
            ))),
        }
    }
}

/// Load and parse a configuration file, format detected by suffix.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => parse(&data, StdinFormat::Json),
        "yaml" | "yml" => parse(&data, StdinFormat::Yaml),
        other => Err(ConfigError::UnknownExtension(other.to_string())),
    }
}

/// Load a configuration from standard input in the given format.
pub fn load_stdin(format: StdinFormat) -> Result<Config, ConfigError> {
    let mut data = String::new();
    std::io::stdin()
        .read_to_string(&mut data)
        .map_err(|source| ConfigError::Read {
            path: "<stdin>".into(),
            source,
        })?;
    parse(&data, format)
}

fn parse(data: &str, format: StdinFormat) -> Result<Config, ConfigError> {
    match format {
        StdinFormat::Json => {
            serde_json::from_str(data).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        StdinFormat::Yaml => {
            serde_yaml::from_str(data).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}
