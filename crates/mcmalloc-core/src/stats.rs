//! Per-thread allocate/release counters.
//!
//! Each thread row owns one [`CallStats`]; other threads (the reporter) may
//! read it at any time. All counters use relaxed ordering: values are
//! monotone and a snapshot is only ever approximate.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::size_class::roundup_log2;

/// Buckets indexed by `max(1, ceil(log2(size)))`.
pub const STAT_BUCKETS: usize = 64;

/// Buckets written by the reporter, `0..=REPORT_MAX_BUCKET`.
pub const REPORT_MAX_BUCKET: usize = 30;

#[inline]
pub const fn bucket_of(size: usize) -> usize {
    let b = roundup_log2(size);
    if b >= STAT_BUCKETS { STAT_BUCKETS - 1 } else { b }
}

#[derive(Debug)]
pub struct CallStats {
    malloc: [AtomicU64; STAT_BUCKETS],
    free: [AtomicU64; STAT_BUCKETS],
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStats {
    pub const fn new() -> Self {
        Self {
            malloc: [const { AtomicU64::new(0) }; STAT_BUCKETS],
            free: [const { AtomicU64::new(0) }; STAT_BUCKETS],
        }
    }

    #[inline]
    pub fn record_malloc(&self, size: usize) {
        self.malloc[bucket_of(size)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, size: usize) {
        self.free[bucket_of(size)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn malloc_at(&self, bucket: usize) -> u64 {
        self.malloc
            .get(bucket)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn free_at(&self, bucket: usize) -> u64 {
        self.free.get(bucket).map_or(0, |c| c.load(Ordering::Relaxed))
    }
}

/// Point-in-time sum of one or more [`CallStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatsSnapshot {
    pub malloc: [u64; STAT_BUCKETS],
    pub free: [u64; STAT_BUCKETS],
}

impl Default for CallStatsSnapshot {
    fn default() -> Self {
        Self {
            malloc: [0; STAT_BUCKETS],
            free: [0; STAT_BUCKETS],
        }
    }
}

impl CallStatsSnapshot {
    pub fn aggregate<'a>(rows: impl IntoIterator<Item = &'a CallStats>) -> Self {
        let mut snap = Self::default();
        for row in rows {
            for b in 0..STAT_BUCKETS {
                snap.malloc[b] += row.malloc_at(b);
                snap.free[b] += row.free_at(b);
            }
        }
        snap
    }

    pub fn total_malloc(&self) -> u64 {
        self.malloc.iter().sum()
    }

    pub fn total_free(&self) -> u64 {
        self.free.iter().sum()
    }

    /// Calls not yet matched by a release. Negative when memory allocated by
    /// other means was released here.
    pub fn outstanding(&self, bucket: usize) -> i64 {
        self.malloc[bucket] as i64 - self.free[bucket] as i64
    }
}

/// Running maxima across reporter samples.
#[derive(Debug, Clone, Default)]
pub struct StatsHistory {
    max_outstanding: [i64; REPORT_MAX_BUCKET + 1],
    max_total: i64,
}

impl StatsHistory {
    /// Fold `snap` into the maxima and write one sample in both report
    /// formats: the per-bucket table and the single totals line.
    pub fn record(
        &mut self,
        elapsed_ms: u64,
        snap: &CallStatsSnapshot,
        buckets: &mut impl Write,
        totals: &mut impl Write,
    ) -> fmt::Result {
        writeln!(buckets, "# time={elapsed_ms}")?;
        let mut total_malloc = 0u64;
        let mut total_free = 0u64;
        for b in 0..=REPORT_MAX_BUCKET {
            let outstanding = snap.outstanding(b);
            self.max_outstanding[b] = self.max_outstanding[b].max(outstanding);
            total_malloc += snap.malloc[b];
            total_free += snap.free[b];
            writeln!(
                buckets,
                "{b} {} {} {outstanding} {}",
                snap.malloc[b], snap.free[b], self.max_outstanding[b]
            )?;
        }
        writeln!(buckets)?;
        writeln!(buckets)?;

        let sum: i64 = self.max_outstanding.iter().sum();
        self.max_total = self.max_total.max(sum);
        writeln!(
            totals,
            "{elapsed_ms} {total_malloc} {total_free} {} {}",
            total_malloc as i64 - total_free as i64,
            self.max_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_of() {
        assert_eq!(bucket_of(0), 1);
        assert_eq!(bucket_of(8), 3);
        assert_eq!(bucket_of(100), 7);
        assert_eq!(bucket_of(usize::MAX), STAT_BUCKETS - 1);
    }

    #[test]
    fn test_record_and_aggregate() {
        let a = CallStats::new();
        let b = CallStats::new();
        a.record_malloc(100);
        a.record_malloc(120);
        b.record_malloc(100);
        b.record_free(128);
        let snap = CallStatsSnapshot::aggregate([&a, &b]);
        assert_eq!(snap.malloc[7], 3);
        assert_eq!(snap.free[7], 1);
        assert_eq!(snap.outstanding(7), 2);
        assert_eq!(snap.total_malloc(), 3);
        assert_eq!(snap.total_free(), 1);
    }

    #[test]
    fn test_out_of_range_bucket_reads_zero() {
        let stats = CallStats::new();
        assert_eq!(stats.malloc_at(STAT_BUCKETS), 0);
        assert_eq!(stats.free_at(usize::MAX), 0);
    }

    #[test]
    fn test_history_tracks_maxima() {
        let stats = CallStats::new();
        let mut history = StatsHistory::default();
        for _ in 0..5 {
            stats.record_malloc(16);
        }
        let mut buckets = String::new();
        let mut totals = String::new();
        let snap = CallStatsSnapshot::aggregate([&stats]);
        history.record(0, &snap, &mut buckets, &mut totals).unwrap();
        for _ in 0..5 {
            stats.record_free(16);
        }
        let snap = CallStatsSnapshot::aggregate([&stats]);
        history.record(250, &snap, &mut buckets, &mut totals).unwrap();

        assert!(buckets.starts_with("# time=0\n0 0 0 0 0\n"));
        assert!(buckets.contains("# time=250\n"));
        assert!(buckets.contains("\n4 5 5 0 5\n"));
        assert_eq!(totals, "0 5 0 5 5\n250 5 5 0 5\n");
    }
}
