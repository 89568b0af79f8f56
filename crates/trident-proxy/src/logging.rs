//! Logging setup.
//!
//! The numeric `log_level` maps onto tracing levels (0=debug, 1=info,
//! 2=warn, 3=error, 4=fatal→error, 5=off). When a log file is configured
//! but cannot be opened, logging falls back to stderr instead of failing
//! startup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Map the config's numeric level to a tracing filter.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::DEBUG,
        1 => LevelFilter::INFO,
        2 => LevelFilter::WARN,
        3 | 4 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

/// Install the global subscriber.
pub fn init(level: u8, log_file: Option<&str>) {
    let writer = match log_file {
        Some(path) => {
            match std::fs::OpenOptions::new().append(true).create(true).open(path) {
                Ok(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
                Err(e) => {
                    eprintln!("failed to open log file {path}: {e}, logging to stderr");
                    BoxMakeWriter::new(std::io::stderr)
                }
            }
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level_filter(level))
        .with_writer(writer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(level_filter(0), LevelFilter::DEBUG);
        assert_eq!(level_filter(1), LevelFilter::INFO);
        assert_eq!(level_filter(2), LevelFilter::WARN);
        assert_eq!(level_filter(3), LevelFilter::ERROR);
        assert_eq!(level_filter(4), LevelFilter::ERROR);
        assert_eq!(level_filter(5), LevelFilter::OFF);
        assert_eq!(level_filter(42), LevelFilter::OFF);
    }
}
