//! Process-wide runtime counters.
//!
//! Lock-free atomics, single writer per event source, any number of
//! readers. Snapshot for programmatic access, `summary()` for humans.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global counters instance.
pub static COUNTERS: Counters = Counters::new();

pub struct Counters {
    pub workers_spawned: AtomicU64,
    pub workers_terminated: AtomicU64,

    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,

    pub log_records_dropped: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            workers_spawned: AtomicU64::new(0),
            workers_terminated: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            log_records_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_workers_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_workers_terminated(&self) {
        self.workers_terminated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_log_records_dropped(&self) {
        self.log_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_terminated: self.workers_terminated.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            log_records_dropped: self.log_records_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of counters for reading.
#[derive(Debug, Clone)]
pub struct CountersSnapshot {
    pub workers_spawned: u64,
    pub workers_terminated: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub log_records_dropped: u64,
    pub protocol_errors: u64,
}

impl CountersSnapshot {
    /// Format as human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Workers: {} spawned, {} terminated | \
             Messages: {} sent, {} received, {} dropped | \
             Logs dropped: {} | Protocol errors: {}",
            self.workers_spawned,
            self.workers_terminated,
            self.messages_sent,
            self.messages_received,
            self.messages_dropped,
            self.log_records_dropped,
            self.protocol_errors,
        )
    }
}
