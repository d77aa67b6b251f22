//! Utility modules for the scanner

pub mod scan_options;
pub mod target_parser;

/// Logging utilities
pub struct Logger;

impl Logger {
    /// Initialize logger with specified level; `RUST_LOG` still wins per module
    pub fn init(level: log::LevelFilter) {
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format_timestamp_secs()
            .init();
    }
}
