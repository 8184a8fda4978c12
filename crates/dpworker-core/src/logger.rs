//! Kernel-style stderr backend for the `log` facade
//!
//! Every crate in the workspace logs through `log::{error, warn, info,
//! debug, trace}`; this module is the sink. Each record is written as one
//! line under the stderr lock, optionally flushed, and tagged with the
//! worker id of the emitting thread when one is set.
//!
//! # Environment Variables
//!
//! - `DPW_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0..5
//! - `DPW_FLUSH_EPRINT=1` - flush stderr after every line (crash debugging)

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::env::{env_get, env_get_bool};

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOGGER: KLogger = KLogger;

thread_local! {
    static WORKER_TAG: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Tag log lines from this thread with a worker id
pub fn set_worker_tag(id: usize) {
    WORKER_TAG.with(|c| c.set(id));
}

/// Stderr logger, one locked write per record
pub struct KLogger;

fn prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR]",
        Level::Warn => "[WARN] ",
        Level::Info => "[INFO] ",
        Level::Debug => "[DEBUG]",
        Level::Trace => "[TRACE]",
    }
}

/// Parse a level name or number as accepted by `DPW_LOG_LEVEL`
pub fn parse_level(val: &str) -> Option<LevelFilter> {
    match val.trim().to_ascii_lowercase().as_str() {
        "off" | "0" => Some(LevelFilter::Off),
        "error" | "1" => Some(LevelFilter::Error),
        "warn" | "2" => Some(LevelFilter::Warn),
        "info" | "3" => Some(LevelFilter::Info),
        "debug" | "4" => Some(LevelFilter::Debug),
        "trace" | "5" => Some(LevelFilter::Trace),
        _ => None,
    }
}

impl Log for KLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let tag = WORKER_TAG.with(|c| c.get());
        let _ = if tag == usize::MAX {
            write!(handle, "{} ", prefix(record.level()))
        } else {
            write!(handle, "{} [w{}] ", prefix(record.level()), tag)
        };
        let _ = handle.write_fmt(*record.args());
        let _ = handle.write_all(b"\n");
        if FLUSH_ENABLED.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger and read level/flush settings from the environment.
///
/// Safe to call more than once; only the first call installs. Returns false
/// if another logger already owns the facade.
pub fn init() -> bool {
    init_with_level(LevelFilter::Info)
}

/// Like [`init`] with an explicit default level; `DPW_LOG_LEVEL` still wins.
pub fn init_with_level(default: LevelFilter) -> bool {
    FLUSH_ENABLED.store(env_get_bool("DPW_FLUSH_EPRINT", false), Ordering::Relaxed);
    let level = parse_level(&env_get("DPW_LOG_LEVEL", String::new())).unwrap_or(default);

    match log::set_logger(&LOGGER) {
        Ok(()) => {
            log::set_max_level(level);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warn"), Some(LevelFilter::Warn));
        assert_eq!(parse_level(" 4 "), Some(LevelFilter::Debug));
        assert_eq!(parse_level("OFF"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_prefix_width() {
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert_eq!(prefix(level).len(), 7);
        }
    }

    #[test]
    fn test_init_idempotent() {
        init_with_level(LevelFilter::Off);
        assert!(!init_with_level(LevelFilter::Off));
        log::info!("not shown");
    }
}
