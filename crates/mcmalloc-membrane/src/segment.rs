//! Segmented stack: a LIFO of chunks stored in page-sized arrays.
//!
//! Segments form a doubly linked list. Every segment below the top is full,
//! the top holds `cursor` chunks, and a segment above the top (left behind by
//! pops) is kept as a spare for the next push. Whole full segments can be
//! spliced out from just below the top and into another stack in O(1).

use std::mem::size_of;
use std::ptr::NonNull;

use mcmalloc_core::MallocError;
use mcmalloc_core::layout::{SEGMENT_BYTES, SEGMENT_CAPACITY};

use crate::chunk::Chunk;
use crate::metrics::EngineMetrics;
use crate::region::RegionSupplier;

const PREFETCH_STRIDE: usize = 4;

#[repr(C)]
struct Segment {
    prev: Option<NonNull<Segment>>,
    slots: [Option<Chunk>; SEGMENT_CAPACITY],
    next: Option<NonNull<Segment>>,
}

const _: () = assert!(size_of::<Segment>() == SEGMENT_BYTES);

impl Segment {
    /// Carve a fresh, unlinked segment from `region`.
    fn create(
        region: &mut RegionSupplier,
        metrics: &EngineMetrics,
    ) -> Result<NonNull<Segment>, MallocError> {
        let seg = region.acquire(SEGMENT_BYTES, metrics)?.cast::<Segment>();
        // SAFETY: a page-aligned span of exactly one segment, never handed out
        // before. Only the links need initializing; slots are written before
        // they are read.
        unsafe {
            (&raw mut (*seg.as_ptr()).prev).write(None);
            (&raw mut (*seg.as_ptr()).next).write(None);
        }
        Ok(seg)
    }
}

/// A full segment detached from one stack, on its way to another.
#[derive(Debug)]
pub struct SegmentRef(NonNull<Segment>);

// SAFETY: a detached segment is reachable only through this handle.
unsafe impl Send for SegmentRef {}

#[derive(Debug)]
pub struct SegmentedStack {
    top: Option<NonNull<Segment>>,
    /// Chunks in the top segment.
    cursor: usize,
    len: usize,
    /// Segments from the bottom up to the top, never below 1. Before the
    /// first push the bottom segment is counted but not yet carved. Spares
    /// above the top are not counted.
    segments: usize,
}

// SAFETY: the stack owns its segments; they are only reached through it.
unsafe impl Send for SegmentedStack {}

impl Default for SegmentedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedStack {
    /// An empty stack of one segment. The segment's memory is carved from
    /// the region supplier on the first push.
    pub const fn new() -> Self {
        Self {
            top: None,
            cursor: 0,
            len: 0,
            segments: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments
    }

    fn prime(
        &mut self,
        region: &mut RegionSupplier,
        metrics: &EngineMetrics,
    ) -> Result<NonNull<Segment>, MallocError> {
        if let Some(top) = self.top {
            return Ok(top);
        }
        let top = Segment::create(region, metrics)?;
        self.top = Some(top);
        self.cursor = 0;
        Ok(top)
    }

    pub fn push(
        &mut self,
        chunk: Chunk,
        region: &mut RegionSupplier,
        metrics: &EngineMetrics,
    ) -> Result<(), MallocError> {
        let mut top = self.prime(region, metrics)?;
        if self.cursor == SEGMENT_CAPACITY {
            // SAFETY: `top` is a live segment owned by this stack.
            let next = match unsafe { top.as_ref().next } {
                Some(spare) => spare,
                None => {
                    let fresh = Segment::create(region, metrics)?;
                    // SAFETY: both segments are ours and `fresh` is unlinked.
                    unsafe {
                        (*fresh.as_ptr()).prev = Some(top);
                        top.as_mut().next = Some(fresh);
                    }
                    fresh
                }
            };
            top = next;
            self.top = Some(top);
            self.cursor = 0;
            self.segments += 1;
        }
        // SAFETY: `cursor < SEGMENT_CAPACITY` after the advance above.
        unsafe { (*top.as_ptr()).slots[self.cursor] = Some(chunk) };
        self.cursor += 1;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Chunk> {
        if self.len == 0 {
            return None;
        }
        let mut top = self.top?;
        if self.cursor == 0 {
            // Every segment below a non-empty stack's empty top is full.
            // SAFETY: `top` is live; `len > 0` means a previous segment exists.
            top = unsafe { top.as_ref().prev }?;
            self.top = Some(top);
            self.cursor = SEGMENT_CAPACITY;
            self.segments -= 1;
        }
        self.cursor -= 1;
        // SAFETY: `cursor` indexes a slot written by `push` or a full segment.
        let seg = unsafe { top.as_ref() };
        prefetch(&seg.slots, self.cursor);
        self.len -= 1;
        seg.slots[self.cursor]
    }

    /// Detach the full segment just below the top.
    ///
    /// Returns `None` unless at least two segments are linked.
    pub fn pop_mid_segment(&mut self) -> Option<SegmentRef> {
        if self.segments < 2 {
            return None;
        }
        let mut top = self.top?;
        // SAFETY: `segments >= 2`, so `top.prev` exists; all three segments
        // belong to this stack.
        unsafe {
            let mid = top.as_ref().prev?;
            let below = (*mid.as_ptr()).prev;
            top.as_mut().prev = below;
            if let Some(mut below) = below {
                below.as_mut().next = Some(top);
            }
            (*mid.as_ptr()).prev = None;
            (*mid.as_ptr()).next = None;
            self.segments -= 1;
            self.len -= SEGMENT_CAPACITY;
            Some(SegmentRef(mid))
        }
    }

    /// Insert a full segment just below the top, priming the stack if needed.
    pub fn push_mid_segment(
        &mut self,
        seg: SegmentRef,
        region: &mut RegionSupplier,
        metrics: &EngineMetrics,
    ) -> Result<(), MallocError> {
        let mut top = self.prime(region, metrics)?;
        let mid = seg.0;
        // SAFETY: `mid` is detached and owned by `seg`; `top` and its
        // neighbour belong to this stack.
        unsafe {
            let below = top.as_ref().prev;
            (*mid.as_ptr()).prev = below;
            (*mid.as_ptr()).next = Some(top);
            if let Some(mut below) = below {
                below.as_mut().next = Some(mid);
            }
            top.as_mut().prev = Some(mid);
        }
        self.segments += 1;
        self.len += SEGMENT_CAPACITY;
        Ok(())
    }
}

#[inline(always)]
fn prefetch(slots: &[Option<Chunk>; SEGMENT_CAPACITY], cursor: usize) {
    let idx = cursor.checked_sub(PREFETCH_STRIDE).unwrap_or(cursor);
    if let Some(chunk) = slots[idx] {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: prefetch is a hint and never faults.
        unsafe {
            core::arch::x86_64::_mm_prefetch(
                chunk.header_addr() as *const i8,
                core::arch::x86_64::_MM_HINT_T0,
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmalloc_core::layout::{PAGE_SIZE, unit_size};

    /// A run of chunks of class 6 (64 bytes) carved from one region span.
    fn chunks(region: &mut RegionSupplier, metrics: &EngineMetrics, n: usize) -> Vec<Chunk> {
        let unit = unit_size(64).unwrap();
        let bytes = mcmalloc_core::layout::align_up(unit * n, PAGE_SIZE);
        let base = region.acquire(bytes, metrics).unwrap();
        (0..n)
            // SAFETY: each unit lies inside the span just acquired.
            .map(|i| unsafe { Chunk::construct(base.add(i * unit), 64, 6) })
            .collect()
    }

    #[test]
    fn test_lifo_order() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let cs = chunks(&mut region, &metrics, 10);
        let mut stack = SegmentedStack::new();
        assert_eq!(stack.pop(), None);
        for &c in &cs {
            stack.push(c, &mut region, &metrics).unwrap();
        }
        assert_eq!(stack.len(), 10);
        assert_eq!(stack.segment_count(), 1);
        for &c in cs.iter().rev() {
            assert_eq!(stack.pop(), Some(c));
        }
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_segment_count_never_below_one() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let mut stack = SegmentedStack::new();
        assert_eq!(stack.segment_count(), 1);
        assert_eq!(metrics.snapshot().region_maps, 0);

        let cs = chunks(&mut region, &metrics, 2 * SEGMENT_CAPACITY + 1);
        for &c in &cs {
            stack.push(c, &mut region, &metrics).unwrap();
        }
        assert_eq!(stack.segment_count(), 3);
        while stack.pop().is_some() {
            assert!(stack.segment_count() >= 1);
        }
        assert_eq!(stack.segment_count(), 1);
        assert!(stack.pop_mid_segment().is_none());

        // A segment spliced into an untouched stack sits below its first one.
        let mut donor = SegmentedStack::new();
        for &c in &cs[..2 * SEGMENT_CAPACITY] {
            donor.push(c, &mut region, &metrics).unwrap();
        }
        let seg = donor.pop_mid_segment().unwrap();
        assert_eq!(donor.segment_count(), 1);
        let mut fresh = SegmentedStack::new();
        fresh.push_mid_segment(seg, &mut region, &metrics).unwrap();
        assert_eq!(fresh.segment_count(), 2);
        assert_eq!(fresh.len(), SEGMENT_CAPACITY);
        while fresh.pop().is_some() {}
        assert_eq!(fresh.segment_count(), 1);
    }

    #[test]
    fn test_crosses_segment_boundaries() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let n = 2 * SEGMENT_CAPACITY + 5;
        let cs = chunks(&mut region, &metrics, n);
        let mut stack = SegmentedStack::new();
        for &c in &cs {
            stack.push(c, &mut region, &metrics).unwrap();
        }
        assert_eq!(stack.segment_count(), 3);
        for &c in cs.iter().rev().take(SEGMENT_CAPACITY + 5) {
            assert_eq!(stack.pop(), Some(c));
        }
        assert_eq!(stack.segment_count(), 2);
        // Pushing again reuses the spare segment left above the top.
        let maps = metrics.snapshot().region_maps;
        for &c in &cs[SEGMENT_CAPACITY..] {
            stack.push(c, &mut region, &metrics).unwrap();
        }
        assert_eq!(stack.segment_count(), 3);
        assert_eq!(metrics.snapshot().region_maps, maps);
        let mut popped = 0;
        while stack.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, n);
    }

    #[test]
    fn test_mid_segment_transfer() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let n = 2 * SEGMENT_CAPACITY + 3;
        let cs = chunks(&mut region, &metrics, n);
        let mut from = SegmentedStack::new();
        for &c in &cs {
            from.push(c, &mut region, &metrics).unwrap();
        }

        let seg = from.pop_mid_segment().unwrap();
        assert_eq!(from.len(), n - SEGMENT_CAPACITY);
        assert_eq!(from.segment_count(), 2);

        let mut to = SegmentedStack::new();
        to.push_mid_segment(seg, &mut region, &metrics).unwrap();
        assert_eq!(to.len(), SEGMENT_CAPACITY);
        assert_eq!(to.segment_count(), 2);

        // The moved segment held the second full run of pushes.
        let moved = &cs[SEGMENT_CAPACITY..2 * SEGMENT_CAPACITY];
        for &c in moved.iter().rev() {
            assert_eq!(to.pop(), Some(c));
        }
        assert_eq!(to.pop(), None);

        // What stayed is the top run followed by the bottom run.
        let mut rest = Vec::new();
        while let Some(c) = from.pop() {
            rest.push(c);
        }
        let mut expected: Vec<Chunk> = cs[2 * SEGMENT_CAPACITY..].iter().rev().copied().collect();
        expected.extend(cs[..SEGMENT_CAPACITY].iter().rev());
        assert_eq!(rest, expected);
    }

    #[test]
    fn test_pop_mid_needs_two_segments() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let cs = chunks(&mut region, &metrics, SEGMENT_CAPACITY);
        let mut stack = SegmentedStack::new();
        assert!(stack.pop_mid_segment().is_none());
        for &c in &cs {
            stack.push(c, &mut region, &metrics).unwrap();
        }
        assert!(stack.pop_mid_segment().is_none());
        assert_eq!(stack.len(), SEGMENT_CAPACITY);
    }

    #[test]
    fn test_push_mid_below_partial_top() {
        let metrics = EngineMetrics::new();
        let mut region = RegionSupplier::new();
        let cs = chunks(&mut region, &metrics, 2 * SEGMENT_CAPACITY + 2);
        let mut donor = SegmentedStack::new();
        for &c in &cs[..2 * SEGMENT_CAPACITY] {
            donor.push(c, &mut region, &metrics).unwrap();
        }
        let seg = donor.pop_mid_segment();
        assert!(seg.is_some());

        let mut stack = SegmentedStack::new();
        stack.push(cs[2 * SEGMENT_CAPACITY], &mut region, &metrics).unwrap();
        stack.push(cs[2 * SEGMENT_CAPACITY + 1], &mut region, &metrics).unwrap();
        stack.push_mid_segment(seg.unwrap(), &mut region, &metrics).unwrap();
        assert_eq!(stack.len(), SEGMENT_CAPACITY + 2);
        assert_eq!(stack.pop(), Some(cs[2 * SEGMENT_CAPACITY + 1]));
        assert_eq!(stack.pop(), Some(cs[2 * SEGMENT_CAPACITY]));
        assert_eq!(stack.pop(), Some(cs[SEGMENT_CAPACITY - 1]));
    }
}
