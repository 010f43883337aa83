//! # Kernel Logger
//!
//! `log` facade backend for the whole kernel. Records go to the QEMU
//! debug console; the framebuffer shows coarse boot progress separately
//! and carries no text.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        kernel_qemu::qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Call once, before the first subsystem init.
///
/// # Errors
/// [`SetLoggerError`] when a logger is already installed.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
