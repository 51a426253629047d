//! Scan counters
//!
//! Lock-free counters shared by the shard tasks of one scan. Shard tasks
//! only ever increment; readers take a [`ScanProgress`] snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for one scan pass
#[derive(Debug)]
pub struct ScanCounters {
    started: Instant,
    shards: u64,
    round_trips: AtomicU64,
    keys_emitted: AtomicU64,
    keys_discarded: AtomicU64,
    shards_completed: AtomicU64,
    shards_stalled: AtomicU64,
    shards_wrapped: AtomicU64,
    shards_failed: AtomicU64,
}

impl ScanCounters {
    pub fn new(shards: usize) -> Self {
        Self {
            started: Instant::now(),
            shards: shards as u64,
            round_trips: AtomicU64::new(0),
            keys_emitted: AtomicU64::new(0),
            keys_discarded: AtomicU64::new(0),
            shards_completed: AtomicU64::new(0),
            shards_stalled: AtomicU64::new(0),
            shards_wrapped: AtomicU64::new(0),
            shards_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_round_trip(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.keys_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.keys_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.shards_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stalled(&self) {
        self.shards_stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wrapped(&self) {
        self.shards_wrapped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.shards_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            shards: self.shards,
            round_trips: self.round_trips.load(Ordering::Relaxed),
            keys_emitted: self.keys_emitted.load(Ordering::Relaxed),
            keys_discarded: self.keys_discarded.load(Ordering::Relaxed),
            shards_completed: self.shards_completed.load(Ordering::Relaxed),
            shards_stalled: self.shards_stalled.load(Ordering::Relaxed),
            shards_wrapped: self.shards_wrapped.load(Ordering::Relaxed),
            shards_failed: self.shards_failed.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Point-in-time view of a scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Shards in the directory snapshot
    pub shards: u64,
    /// SCAN round-trips issued
    pub round_trips: u64,
    /// Keys handed to the consumer side
    pub keys_emitted: u64,
    /// Keys dropped because demand ran out mid-batch
    pub keys_discarded: u64,
    /// Shards that reached Completed (stalled and wrapped included)
    pub shards_completed: u64,
    /// Shards completed because their cursor stopped advancing
    pub shards_stalled: u64,
    /// Shards completed because their first batch came round again
    pub shards_wrapped: u64,
    /// Shards that failed
    pub shards_failed: u64,
    /// Time since the scan was subscribed
    pub elapsed: Duration,
}

impl ScanProgress {
    /// Shards still scanning
    pub fn shards_active(&self) -> u64 {
        self.shards
            .saturating_sub(self.shards_completed)
            .saturating_sub(self.shards_failed)
    }

    pub fn keys_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.keys_emitted as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_snapshot() {
        let counters = ScanCounters::new(3);
        counters.record_round_trip();
        counters.record_round_trip();
        counters.record_emitted();
        counters.record_discarded(4);
        counters.record_stalled();
        counters.record_completed();
        counters.record_failed();

        let progress = counters.progress();
        assert_eq!(progress.shards, 3);
        assert_eq!(progress.round_trips, 2);
        assert_eq!(progress.keys_emitted, 1);
        assert_eq!(progress.keys_discarded, 4);
        assert_eq!(progress.shards_stalled, 1);
        assert_eq!(progress.shards_active(), 1);
    }
}
