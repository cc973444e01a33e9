// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Console logging backend for the `log` facade.
//!
//! The library logs through `log::{debug!, info!, warn!, error!}` everywhere;
//! this module gives binaries a minimal stderr backend with runtime level
//! filtering. Library users with their own logger simply never call
//! [`init_logger`].

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicUsize, Ordering};

static LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);
static LOGGER: ConsoleLogger = ConsoleLogger;

/// Stderr logger with a `[unix-millis] LEVEL message` line format.
pub struct ConsoleLogger;

impl ConsoleLogger {
    fn current_filter() -> LevelFilter {
        match LEVEL.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Self::current_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        eprintln!(
            "[{}] {} {}",
            crate::buffer::unix_time_ms(),
            level,
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the console logger at the given level.
///
/// Safe to call more than once; only the first call installs the logger,
/// later calls just adjust the level filter.
pub fn init_logger(filter: LevelFilter) {
    LEVEL.store(filter as usize, Ordering::Relaxed);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    } else {
        // Logger already installed (ours or someone else's); keep the more
        // permissive max level so the filter change can take effect.
        if log::max_level() < filter {
            log::set_max_level(filter);
        }
    }
}

/// Parse a user-supplied level name ("error", "warn", "info", "debug",
/// "trace", "off").
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logger(LevelFilter::Info);
        init_logger(LevelFilter::Debug);
        // Second call must not panic and raises the filter.
        assert_eq!(ConsoleLogger::current_filter(), LevelFilter::Debug);
    }

    #[test]
    fn test_log_after_init_does_not_panic() {
        init_logger(LevelFilter::Info);
        log::info!("logger smoke test");
        log::debug!("filtered out at info");
    }
}
