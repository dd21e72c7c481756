//! Early kernel logging over the 0xE9 debug port.

use core::fmt::{self, Write};
use kernel_sync::SyncOnceCell;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log::Log` sink writing `[LEVEL] target: message` lines to the
/// emulator debug port. No allocation, usable from the first instant of
/// boot.
pub struct DebugPortLogger {
    max_level: LevelFilter,
}

impl DebugPortLogger {
    /// Install the logger; call once during early init.
    ///
    /// # Errors
    /// [`SetLoggerError`] if another logger is already installed.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        static LOGGER: SyncOnceCell<DebugPortLogger> = SyncOnceCell::new();
        let logger = LOGGER.get_or_init(|| DebugPortLogger { max_level });
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DebugPortLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = DebugPort;
        let _ = writeln!(
            port,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

struct DebugPort;

impl Write for DebugPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            debug_out(byte);
        }
        Ok(())
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn debug_out(byte: u8) {
    unsafe {
        core::arch::asm!("out 0xe9, al", in("al") byte, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn debug_out(_byte: u8) {}
