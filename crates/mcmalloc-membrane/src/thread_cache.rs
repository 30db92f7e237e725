//! One row of the cache matrix: everything a thread owns privately.

use mcmalloc_core::MallocError;
use mcmalloc_core::batch::next_refill_count;
use mcmalloc_core::size_class::NUM_SIZE_CLASSES;

use crate::chunk::Chunk;
use crate::metrics::EngineMetrics;
use crate::region::RegionSupplier;
use crate::segment::{SegmentRef, SegmentedStack};

/// Per-thread free lists (one per size class), refill counters and the
/// thread's region reservation.
///
/// A row is only touched by the thread that currently holds its index, so
/// nothing in here is synchronized.
pub struct ThreadCache {
    stacks: [SegmentedStack; NUM_SIZE_CLASSES],
    refill: [usize; NUM_SIZE_CLASSES],
    region: RegionSupplier,
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            stacks: [const { SegmentedStack::new() }; NUM_SIZE_CLASSES],
            refill: [0; NUM_SIZE_CLASSES],
            region: RegionSupplier::new(),
        }
    }

    #[inline]
    pub fn pop(&mut self, class: usize) -> Option<Chunk> {
        self.stacks[class].pop()
    }

    #[inline]
    pub fn push(
        &mut self,
        class: usize,
        chunk: Chunk,
        metrics: &EngineMetrics,
    ) -> Result<(), MallocError> {
        self.stacks[class].push(chunk, &mut self.region, metrics)
    }

    pub fn pop_mid_segment(&mut self, class: usize) -> Option<SegmentRef> {
        self.stacks[class].pop_mid_segment()
    }

    pub fn push_segment(
        &mut self,
        class: usize,
        seg: SegmentRef,
        metrics: &EngineMetrics,
    ) -> Result<(), MallocError> {
        self.stacks[class].push_mid_segment(seg, &mut self.region, metrics)
    }

    /// Advance and return this thread's batch count for `class`.
    pub fn next_refill_count(&mut self, class: usize, class_bytes: usize) -> usize {
        let n = next_refill_count(self.refill[class], class_bytes);
        self.refill[class] = n;
        n
    }

    pub fn region_mut(&mut self) -> &mut RegionSupplier {
        &mut self.region
    }

    pub fn stack(&self, class: usize) -> &SegmentedStack {
        &self.stacks[class]
    }

    /// Chunks cached across every class.
    pub fn cached_chunks(&self) -> usize {
        self.stacks.iter().map(SegmentedStack::len).sum()
    }
}
