//! Instrumentation primitives
//!
//! A lock-free sliding counter tracking gateway-wide request throughput over
//! the last second, and per-stage execution accounting fed by the dispatch
//! wrapper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Number of sub-buckets the one-second window is split into
const RATE_BUCKETS: u64 = 10;

/// Lock-free sliding counter over a one-second window.
///
/// The window is split into sub-buckets; each bucket carries the epoch slot
/// it was last written in, so stale buckets are recycled on access without
/// any locking.
pub struct GlobalRateCounter {
    started: Instant,
    counts: Vec<AtomicU64>,
    slots: Vec<AtomicU64>,
}

impl Default for GlobalRateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalRateCounter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counts: (0..RATE_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            slots: (0..RATE_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn current_slot(&self) -> u64 {
        let elapsed = self.started.elapsed();
        // 100ms sub-buckets
        elapsed.as_millis() as u64 / (1000 / RATE_BUCKETS)
    }

    /// Record one request
    pub fn incr(&self, amount: u64) {
        let slot = self.current_slot();
        let idx = (slot % RATE_BUCKETS) as usize;
        if self.slots[idx].swap(slot, Ordering::AcqRel) != slot {
            self.counts[idx].store(amount, Ordering::Release);
        } else {
            self.counts[idx].fetch_add(amount, Ordering::AcqRel);
        }
    }

    /// Requests observed over the last second
    pub fn rate(&self) -> u64 {
        let slot = self.current_slot();
        let mut total = 0;
        for idx in 0..RATE_BUCKETS as usize {
            let bucket_slot = self.slots[idx].load(Ordering::Acquire);
            // only buckets written within the current window count
            if slot.saturating_sub(bucket_slot) < RATE_BUCKETS {
                total += self.counts[idx].load(Ordering::Acquire);
            }
        }
        total
    }
}

/// Cumulative execution stats for one stage kind
#[derive(Default)]
pub struct StageStat {
    pub calls: AtomicU64,
    pub errors: AtomicU64,
    pub total_ns: AtomicU64,
}

/// Per-stage execution accounting
#[derive(Default)]
pub struct Instrumentation {
    stats: DashMap<&'static str, StageStat>,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &'static str, elapsed: Duration, errored: bool) {
        let entry = self.stats.entry(stage).or_default();
        entry.calls.fetch_add(1, Ordering::Relaxed);
        entry
            .total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if errored {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot as (stage, calls, errors, total_ns)
    pub fn snapshot(&self) -> Vec<(&'static str, u64, u64, u64)> {
        self.stats
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    e.calls.load(Ordering::Relaxed),
                    e.errors.load(Ordering::Relaxed),
                    e.total_ns.load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_counts_within_window() {
        let counter = GlobalRateCounter::new();
        for _ in 0..100 {
            counter.incr(1);
        }
        assert_eq!(counter.rate(), 100);
    }

    #[test]
    fn rate_counter_forgets_old_window() {
        let counter = GlobalRateCounter::new();
        counter.incr(50);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(counter.rate(), 0);
        counter.incr(1);
        assert_eq!(counter.rate(), 1);
    }

    #[test]
    fn instrumentation_accumulates() {
        let inst = Instrumentation::new();
        inst.record("VersionCheck", Duration::from_micros(10), false);
        inst.record("VersionCheck", Duration::from_micros(20), true);

        let snap = inst.snapshot();
        let (_, calls, errors, total_ns) =
            snap.iter().find(|(name, ..)| *name == "VersionCheck").unwrap();
        assert_eq!(*calls, 2);
        assert_eq!(*errors, 1);
        assert_eq!(*total_ns, 30_000);
    }
}
