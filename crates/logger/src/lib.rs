//! Hypervisor logger
//!
//! Log records are formatted into an in-memory console ring, which the console driver drains.
//! When the ring is full the oldest bytes are overwritten.
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

/// Size of the console ring, in bytes.
pub const CONSOLE_SIZE: usize = 16 * 1024;

static LOGGER: LockedLogger = LockedLogger(Mutex::new(Logger {
    console: Console::new(),
}));
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct LockedLogger(Mutex<Logger>);

struct Logger {
    console: Console<CONSOLE_SIZE>,
}

impl log::Log for LockedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.lock().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.lock().log(record)
    }

    fn flush(&self) {}
}

impl Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&mut self, record: &Record) {
        if self.enabled(record.metadata()) {
            // The ring never refuses bytes.
            let _ = write!(
                self.console,
                "[{} | {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }
}

pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            log::set_logger(&LOGGER).unwrap();
            log::set_max_level(level);
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}

/// Move up to `buf.len()` of the oldest console bytes into `buf`, returns how many were moved.
pub fn read(buf: &mut [u8]) -> usize {
    LOGGER.0.lock().console.read(buf)
}

// ———————————————————————————————— Console ————————————————————————————————— //

struct Console<const N: usize> {
    buf: [u8; N],
    start: usize,
    len: usize,
}

impl<const N: usize> Console<N> {
    const fn new() -> Self {
        Self {
            buf: [0; N],
            start: 0,
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.buf[(self.start + self.len) % N] = byte;
            if self.len == N {
                self.start = (self.start + 1) % N;
            } else {
                self.len += 1;
            }
        }
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        for (idx, byte) in out[..count].iter_mut().enumerate() {
            *byte = self.buf[(self.start + idx) % N];
        }
        self.start = (self.start + count) % N;
        self.len -= count;
        count
    }
}

impl<const N: usize> Write for Console<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
