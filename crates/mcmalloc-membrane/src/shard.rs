//! Overflow pool shared by every thread.
//!
//! One segmented stack per (size class, partition), each behind its own
//! mutex. Threads hand over and take whole segments, so a critical section is
//! a couple of pointer writes.

use parking_lot::Mutex;

use mcmalloc_core::MallocError;
use mcmalloc_core::size_class::NUM_SIZE_CLASSES;

use crate::metrics::EngineMetrics;
use crate::os::MappedArray;
use crate::region::RegionSupplier;
use crate::segment::{SegmentRef, SegmentedStack};

pub struct OverflowPool {
    shards: MappedArray<Mutex<SegmentedStack>>,
    partitions: usize,
}

impl OverflowPool {
    pub fn new(partitions: usize) -> Result<Self, MallocError> {
        let partitions = partitions.max(1);
        let shards = MappedArray::new(NUM_SIZE_CLASSES * partitions, |_| {
            Mutex::new(SegmentedStack::new())
        })?;
        Ok(Self { shards, partitions })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    #[inline]
    fn shard(&self, class: usize, partition: usize) -> &Mutex<SegmentedStack> {
        &self.shards[class * self.partitions + partition]
    }

    #[inline]
    fn home_partition(&self, thread: usize) -> usize {
        thread % self.partitions
    }

    /// Hand a full segment to the partition `thread` hashes to.
    ///
    /// `region` primes the shard's stack on first use; the segment it takes
    /// stays with the shard for good.
    pub fn offload(
        &self,
        seg: SegmentRef,
        class: usize,
        thread: usize,
        region: &mut RegionSupplier,
        metrics: &EngineMetrics,
    ) -> Result<(), MallocError> {
        self.shard(class, self.home_partition(thread))
            .lock()
            .push_mid_segment(seg, region, metrics)?;
        EngineMetrics::inc(&metrics.shard_offloads);
        Ok(())
    }

    /// Take a full segment of `class`, home partition first.
    pub fn adopt(&self, class: usize, thread: usize, metrics: &EngineMetrics) -> Option<SegmentRef> {
        let home = self.home_partition(thread);
        for step in 0..self.partitions {
            let partition = (home + step) % self.partitions;
            if let Some(seg) = self.shard(class, partition).lock().pop_mid_segment() {
                EngineMetrics::inc(&metrics.shard_adopts);
                return Some(seg);
            }
        }
        None
    }

    /// Full segments of `class` waiting in the pool.
    pub fn segments_in(&self, class: usize) -> usize {
        (0..self.partitions)
            .map(|p| self.shard(class, p).lock().segment_count().saturating_sub(1))
            .sum()
    }
}
