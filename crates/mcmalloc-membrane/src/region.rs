//! Region supplier: page-aligned spans carved from large OS mappings.
//!
//! Each thread cache owns one supplier and therefore one reservation. A
//! request is cut from the front of the reservation when it fits; otherwise a
//! new batch is mapped (see [`region_batch_len`]) and whatever was left of the
//! old reservation is unmapped. Spans handed out are never returned
//! individually.

use std::ptr::NonNull;

use mcmalloc_core::MallocError;
use mcmalloc_core::batch::region_batch_len;
use mcmalloc_core::layout::{PAGE_SIZE, align_up};

use crate::metrics::EngineMetrics;
use crate::os;

#[derive(Debug)]
pub struct RegionSupplier {
    head: Option<NonNull<u8>>,
    remaining: usize,
}

// SAFETY: the reservation is plain address space owned by whoever holds the
// supplier.
unsafe impl Send for RegionSupplier {}

impl Default for RegionSupplier {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSupplier {
    pub const fn new() -> Self {
        Self {
            head: None,
            remaining: 0,
        }
    }

    /// Bytes left in the current reservation.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Hand out `len` bytes, mapping a new batch when the reservation is short.
    ///
    /// Callers pass page multiples, so every span and every reservation stays
    /// page-aligned.
    pub fn acquire(
        &mut self,
        len: usize,
        metrics: &EngineMetrics,
    ) -> Result<NonNull<u8>, MallocError> {
        if len == 0 {
            return Err(MallocError::EmptyRegionRequest);
        }
        if let Some(head) = self.head
            && len <= self.remaining
        {
            // SAFETY: `len <= remaining`, so the new head stays inside (or one
            // past the end of) the reservation.
            self.head = Some(unsafe { head.add(len) });
            self.remaining -= len;
            return Ok(head);
        }

        let batch = region_batch_len(len);
        let fresh = os::map(batch)?;
        EngineMetrics::inc(&metrics.region_maps);
        EngineMetrics::add(&metrics.region_bytes, batch as u64);
        self.release_tail(metrics)?;

        // SAFETY: `len <= batch`.
        self.head = Some(unsafe { fresh.add(len) });
        self.remaining = batch - len;
        Ok(fresh)
    }

    /// Unmap the rest of the reservation. Idempotent.
    pub fn release_all(&mut self, metrics: &EngineMetrics) -> Result<(), MallocError> {
        self.release_tail(metrics)
    }

    fn release_tail(&mut self, metrics: &EngineMetrics) -> Result<(), MallocError> {
        let head = self.head.take();
        let remaining = std::mem::take(&mut self.remaining);
        if let Some(head) = head
            && remaining >= PAGE_SIZE
        {
            // SAFETY: the tail was never handed out and is still mapped.
            unsafe { os::unmap(head, align_up(remaining, PAGE_SIZE))? };
            EngineMetrics::inc(&metrics.region_unmaps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "no-batch"))]
    #[test]
    fn test_carves_from_one_batch() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let a = region.acquire(PAGE_SIZE, &metrics).unwrap();
        let b = region.acquire(2 * PAGE_SIZE, &metrics).unwrap();
        assert_eq!(a.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + PAGE_SIZE);
        assert_eq!(metrics.snapshot().region_maps, 1);
        assert_eq!(
            region.remaining(),
            region_batch_len(PAGE_SIZE) - 3 * PAGE_SIZE
        );
        region.release_all(&metrics).unwrap();
    }

    #[test]
    fn test_spans_are_writable() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let p = region.acquire(8 * PAGE_SIZE, &metrics).unwrap();
        // SAFETY: eight pages were just handed out.
        unsafe {
            p.as_ptr().write_bytes(0xA5, 8 * PAGE_SIZE);
            assert_eq!(*p.as_ptr().add(8 * PAGE_SIZE - 1), 0xA5);
        }
        region.release_all(&metrics).unwrap();
    }

    #[cfg(not(feature = "no-batch"))]
    #[test]
    fn test_oversize_request_replaces_reservation() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        region.acquire(PAGE_SIZE, &metrics).unwrap();
        let big = 100 * 1024 * 1024;
        region.acquire(big, &metrics).unwrap();
        let snap = metrics.snapshot();
        assert_eq!(snap.region_maps, 2);
        assert_eq!(snap.region_unmaps, 1);
        // A request equal to the whole batch leaves nothing behind.
        assert_eq!(region.remaining(), 0);
        region.release_all(&metrics).unwrap();
        assert_eq!(metrics.snapshot().region_unmaps, 1);
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        region.release_all(&metrics).unwrap();
        region.acquire(PAGE_SIZE, &metrics).unwrap();
        region.release_all(&metrics).unwrap();
        region.release_all(&metrics).unwrap();
        assert_eq!(region.remaining(), 0);
        let snap = metrics.snapshot();
        assert_eq!(
            snap.region_unmaps,
            u64::from(region_batch_len(PAGE_SIZE) > PAGE_SIZE)
        );
    }

    #[test]
    fn test_zero_request_is_an_error() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        assert_eq!(
            region.acquire(0, &metrics),
            Err(MallocError::EmptyRegionRequest)
        );
    }
}
