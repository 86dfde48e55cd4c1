//! Console-backed implementation of the `log` facade.
//!
//! Diagnostics throughout the kernel go through `log::warn!`/`log::error!`
//! so they carry a level and a target; this module renders them onto the
//! console as `[LEVEL] target: message` lines.

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. Safe to call more than once; only the first
/// call takes effect.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
