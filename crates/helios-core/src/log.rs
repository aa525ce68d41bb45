//! Leveled logging over a fixed ring buffer.
//!
//! No heap allocation happens on the logging path, so the macros are safe
//! from interrupt context and early bring-up. Entries land in a circular
//! buffer the embedder can drain for its console.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use spin::Mutex;

const LOG_BUFFER_SIZE: usize = 128;
const MAX_MESSAGE_LEN: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub level: LogLevel,
    pub seq: u64,
    len: u16,
    text: [u8; MAX_MESSAGE_LEN],
}

impl LogEntry {
    const fn empty() -> Self {
        LogEntry {
            level: LogLevel::Debug,
            seq: 0,
            len: 0,
            text: [0; MAX_MESSAGE_LEN],
        }
    }

    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.text[..self.len as usize]).unwrap_or("<bad utf8>")
    }
}

struct Ring {
    entries: [LogEntry; LOG_BUFFER_SIZE],
    head: usize,
    used: usize,
}

pub struct Logger {
    ring: Mutex<Ring>,
    min_level: AtomicU8,
    seq: AtomicU64,
}

/// Bounded writer used while formatting into a ring slot.
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = self.buf.len() - self.len;
        let take = s.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl Logger {
    const fn new() -> Self {
        Logger {
            ring: Mutex::new(Ring {
                entries: [LogEntry::empty(); LOG_BUFFER_SIZE],
                head: 0,
                used: 0,
            }),
            min_level: AtomicU8::new(LogLevel::Info as u8),
            seq: AtomicU64::new(0),
        }
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level as u8 >= self.min_level.load(Ordering::Relaxed)
    }

    pub fn write(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.ring.lock();
        let slot = ring.head;
        ring.head = (ring.head + 1) % LOG_BUFFER_SIZE;
        if ring.used < LOG_BUFFER_SIZE {
            ring.used += 1;
        }
        let entry = &mut ring.entries[slot];
        entry.level = level;
        entry.seq = seq;
        let mut writer = SliceWriter {
            buf: &mut entry.text,
            len: 0,
        };
        let _ = writer.write_fmt(args);
        entry.len = writer.len as u16;
    }

    /// Drain up to `out.len()` of the oldest buffered entries.
    pub fn drain(&self, out: &mut [LogEntry]) -> usize {
        let mut ring = self.ring.lock();
        let count = ring.used.min(out.len());
        let start = (ring.head + LOG_BUFFER_SIZE - ring.used) % LOG_BUFFER_SIZE;
        for (i, slot) in out.iter_mut().enumerate().take(count) {
            *slot = ring.entries[(start + i) % LOG_BUFFER_SIZE];
        }
        ring.used -= count;
        count
    }
}

static LOGGER: Logger = Logger::new();

pub fn logger() -> &'static Logger {
    &LOGGER
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::logger().write($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::logger().write($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::logger().write($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::logger().write($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}
