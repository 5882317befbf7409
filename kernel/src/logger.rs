//! Kernel logger
//!
//! Backend for the `log` facade, writing level-tagged lines to the serial
//! console. Installed once during bring-up; `kprintln!` remains available
//! for the window before installation and for panic paths.

use log::{Level, LevelFilter, Metadata, Record};

use crate::error::{KernelError, KernelResult};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        crate::kprintln!("[{}] {}: {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger with the given maximum level.
///
/// # Errors
///
/// Returns `KernelError::AlreadyExists` if a logger is already installed.
pub fn init(level: LevelFilter) -> KernelResult<()> {
    log::set_logger(&LOGGER).map_err(|_| KernelError::AlreadyExists)?;
    log::set_max_level(level);
    Ok(())
}

/// Parse a `loglevel=` boot-argument value.
pub fn level_from_str(s: &str) -> Option<LevelFilter> {
    match s {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
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
    fn level_parsing() {
        assert_eq!(level_from_str("info"), Some(LevelFilter::Info));
        assert_eq!(level_from_str("trace"), Some(LevelFilter::Trace));
        assert_eq!(level_from_str("bogus"), None);
    }
}
