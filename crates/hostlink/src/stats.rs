//! Per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by both backends and the dispatcher.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub(crate) calls: AtomicU64,
    pub(crate) completions: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) overflow_retries: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) ring_overflows: AtomicU64,
    pub(crate) records_streamed: AtomicU64,
}

impl ConnStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            overflow_retries: self.overflow_retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
            records_streamed: self.records_streamed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Data-plane calls submitted (Read/WriteRead).
    pub calls: u64,
    /// Externally visible completions delivered.
    pub completions: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Corrective retries after an undersized write-back buffer.
    pub overflow_retries: u64,
    /// Submit-path calls that fell back to the synchronous backend.
    pub fallbacks: u64,
    /// Records that found the ring full.
    pub ring_overflows: u64,
    /// Records streamed through the ring.
    pub records_streamed: u64,
}
