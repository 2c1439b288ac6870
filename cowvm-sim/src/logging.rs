//! # Simple Logging Module
//!
//! A colored logger for the `log` facade, written to stderr.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct Logger;

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // Yellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // Grey
        };
        eprintln!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            color,
            record.level(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

fn parse_level(name: &str) -> LevelFilter {
    match name.to_ascii_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Installs the logger. The level comes from `level` when given, otherwise
/// from the `LOG` environment variable, and defaults to `LevelFilter::Off`.
pub fn init(level: Option<&str>) {
    static LOGGER: Logger = Logger;
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    let filter = match level {
        Some(name) => parse_level(name),
        None => std::env::var("LOG").map_or(LevelFilter::Off, |name| parse_level(&name)),
    };
    log::set_max_level(filter);
}
