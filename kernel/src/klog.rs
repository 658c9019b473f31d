//! Kernel logging infrastructure.
//!
//! Subsystems log through the `log` facade with a short target ("proc",
//! "sched", "ipc", "trap"). The backend is a fixed-capacity ring buffer of
//! formatted lines, so diagnostics survive until a dmesg-style consumer
//! drains them without the core ever allocating. Messages longer than one
//! line slot are truncated.

use core::fmt::Write as _;

use heapless::{Deque, String};
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::lock::Spinlock;

/// Entries kept before the oldest is overwritten.
const LOG_BUFFER_SIZE: usize = 64;

/// Formatted length of a single entry.
const MAX_MESSAGE_LEN: usize = 160;

/// One formatted log line.
#[derive(Clone)]
pub struct LogEntry {
    pub level: Level,
    pub line: String<MAX_MESSAGE_LEN>,
}

/// Ring buffer backend for the `log` facade.
pub struct KernelLog {
    buffer: Spinlock<Deque<LogEntry, LOG_BUFFER_SIZE>>,
}

static KLOG: KernelLog = KernelLog::new();

impl KernelLog {
    pub const fn new() -> Self {
        Self {
            buffer: Spinlock::new(Deque::new()),
        }
    }

    /// Visit the buffered entries, oldest first.
    pub fn for_each(&self, mut visit: impl FnMut(&LogEntry)) {
        for entry in self.buffer.lock().iter() {
            visit(entry);
        }
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Drop all buffered entries.
    pub fn clear(&self) {
        let mut buffer = self.buffer.lock();
        while buffer.pop_front().is_some() {}
    }
}

impl Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        // Level filtering happens in the facade via set_max_level.
        true
    }

    fn log(&self, record: &Record<'_>) {
        let mut line = String::new();
        let _ = write!(line, "{}: {}", record.target(), record.args());

        let mut buffer = self.buffer.lock();
        if buffer.is_full() {
            buffer.pop_front();
        }
        let _ = buffer.push_back(LogEntry {
            level: record.level(),
            line,
        });
    }

    fn flush(&self) {}
}

/// Install the ring buffer as the `log` backend.
///
/// Safe to call more than once; only the first call wins the logger slot.
pub fn init(filter: LevelFilter) {
    let _ = log::set_logger(&KLOG);
    log::set_max_level(filter);
}

/// The global ring buffer, for dmesg-style consumers.
pub fn buffer() -> &'static KernelLog {
    &KLOG
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(klog: &KernelLog, level: Level, target: &str, text: core::fmt::Arguments<'_>) {
        klog.log(
            &Record::builder()
                .args(text)
                .level(level)
                .target(target)
                .build(),
        );
    }

    #[test]
    fn captures_formatted_entries() {
        let klog = KernelLog::new();
        emit(&klog, Level::Info, "klogtest", format_args!("hello {}", 7));

        assert_eq!(klog.len(), 1);
        klog.for_each(|entry| {
            assert_eq!(entry.line.as_str(), "klogtest: hello 7");
            assert_eq!(entry.level, Level::Info);
        });
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let klog = KernelLog::new();
        for i in 0..(LOG_BUFFER_SIZE + 10) {
            emit(&klog, Level::Debug, "fill", format_args!("entry {}", i));
        }
        assert_eq!(klog.len(), LOG_BUFFER_SIZE);

        let mut lines = Vec::new();
        klog.for_each(|entry| lines.push(entry.line.as_str().to_owned()));
        assert_eq!(lines.first().map(|s| s.as_str()), Some("fill: entry 10"));
        assert_eq!(lines.last().map(|s| s.as_str()), Some("fill: entry 73"));
    }

    #[test]
    fn long_messages_are_truncated_not_dropped() {
        let klog = KernelLog::new();
        let long = "x".repeat(2 * MAX_MESSAGE_LEN);
        emit(&klog, Level::Warn, "trunc", format_args!("{}", long));

        assert_eq!(klog.len(), 1);
        klog.for_each(|entry| {
            assert!(entry.line.len() <= MAX_MESSAGE_LEN);
            assert!(entry.line.as_str().starts_with("trunc: "));
        });
    }

    #[test]
    fn clear_empties_the_buffer() {
        let klog = KernelLog::new();
        emit(&klog, Level::Trace, "t", format_args!("one"));
        assert!(!klog.is_empty());
        klog.clear();
        assert!(klog.is_empty());
    }
}
