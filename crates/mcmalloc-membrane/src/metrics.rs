//! Atomic counters for engine slow paths.
//!
//! All counters use relaxed ordering. They are diagnostic, never used for
//! synchronization, and only touched off the per-thread fast path so they do
//! not become a shared hot cache line.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct EngineMetrics {
    /// Local cache misses that looked at the overflow pool.
    pub shard_probes: AtomicU64,
    /// Segments adopted from the overflow pool.
    pub shard_adopts: AtomicU64,
    /// Segments offloaded to the overflow pool.
    pub shard_offloads: AtomicU64,
    /// Cache refills carved from the region supplier.
    pub bulk_refills: AtomicU64,
    /// Chunks constructed by those refills.
    pub chunks_carved: AtomicU64,
    /// OS mappings made by region suppliers.
    pub region_maps: AtomicU64,
    /// Bytes mapped by region suppliers.
    pub region_bytes: AtomicU64,
    /// Reservation tails returned to the OS.
    pub region_unmaps: AtomicU64,
    /// Chunks served by a direct mapping during reentrant allocation.
    pub detached_chunks: AtomicU64,
    /// Learned size classes assigned.
    pub learned_classes: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shard_probes: AtomicU64::new(0),
            shard_adopts: AtomicU64::new(0),
            shard_offloads: AtomicU64::new(0),
            bulk_refills: AtomicU64::new(0),
            chunks_carved: AtomicU64::new(0),
            region_maps: AtomicU64::new(0),
            region_bytes: AtomicU64::new(0),
            region_unmaps: AtomicU64::new(0),
            detached_chunks: AtomicU64::new(0),
            learned_classes: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            shard_probes: Self::get(&self.shard_probes),
            shard_adopts: Self::get(&self.shard_adopts),
            shard_offloads: Self::get(&self.shard_offloads),
            bulk_refills: Self::get(&self.bulk_refills),
            chunks_carved: Self::get(&self.chunks_carved),
            region_maps: Self::get(&self.region_maps),
            region_bytes: Self::get(&self.region_bytes),
            region_unmaps: Self::get(&self.region_unmaps),
            detached_chunks: Self::get(&self.detached_chunks),
            learned_classes: Self::get(&self.learned_classes),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub shard_probes: u64,
    pub shard_adopts: u64,
    pub shard_offloads: u64,
    pub bulk_refills: u64,
    pub chunks_carved: u64,
    pub region_maps: u64,
    pub region_bytes: u64,
    pub region_unmaps: u64,
    pub detached_chunks: u64,
    pub learned_classes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let m = EngineMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_and_add() {
        let m = EngineMetrics::new();
        EngineMetrics::inc(&m.shard_probes);
        EngineMetrics::inc(&m.shard_probes);
        EngineMetrics::add(&m.chunks_carved, 32);
        let snap = m.snapshot();
        assert_eq!(snap.shard_probes, 2);
        assert_eq!(snap.chunks_carved, 32);
        assert_eq!(snap.bulk_refills, 0);
    }
}
