//! The allocator engine.
//!
//! An [`Engine`] owns the cache matrix (one [`ThreadCache`] row per thread
//! index), the overflow pool, the size classifier and the per-row call
//! statistics. Every table lives in its own anonymous mapping, so building an
//! engine never touches the heap it may be standing in for.
//!
//! Allocation walks three tiers: the calling thread's cache, then the
//! overflow pool, then a bulk refill carved from the thread's region
//! reservation. Release pushes onto the *releasing* thread's cache, shedding
//! whole segments to the pool once the cache for a class grows past the
//! offload threshold.
//!
//! Two surfaces sit on top:
//! - [`ThreadContext`] and [`Allocation`], a safe handle API for Rust callers
//! - `unsafe` raw-pointer operations keyed by thread index, used by the C ABI

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use mcmalloc_core::batch::{offload_count, should_offload};
use mcmalloc_core::classifier::LEARN_TABLE_LEN;
use mcmalloc_core::layout::{PAGE_SIZE, checked_align_up, unit_size};
use mcmalloc_core::size_class::{self, MAX_REQUEST_SIZE};
use mcmalloc_core::{
    CallStats, CallStatsSnapshot, EngineConfig, LearnEntry, LearnEvent, MallocError,
    SizeClassifier,
};

use crate::chunk::Chunk;
use crate::lifecycle::{LifecycleEvent, LifecycleLog, LifecycleRecord, LogLevel};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::os::{self, MappedArray};
use crate::registry::ThreadRegistry;
use crate::shard::OverflowPool;
use crate::thread_cache::ThreadCache;

static NEXT_ENGINE_ID: AtomicU32 = AtomicU32::new(1);

/// One cache-matrix row. Only the thread holding the row's index touches it.
struct Row(UnsafeCell<ThreadCache>);

// SAFETY: access is serialized by index ownership (see `Engine::cache_row`).
unsafe impl Sync for Row {}

pub struct Engine {
    id: u32,
    config: EngineConfig,
    classifier: SizeClassifier<MappedArray<LearnEntry>>,
    rows: MappedArray<Row>,
    stats: MappedArray<CallStats>,
    pool: OverflowPool,
    registry: ThreadRegistry,
    metrics: EngineMetrics,
    events: LifecycleLog,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, MallocError> {
        let config = config
            .with_thread_capacity(config.thread_capacity)
            .with_shard_partitions(config.shard_partitions);
        // SAFETY: an all-zero `LearnEntry` is the unobserved state.
        let table = unsafe { MappedArray::<LearnEntry>::zeroed(LEARN_TABLE_LEN)? };
        let classifier = SizeClassifier::with_table(table)?;
        let rows = MappedArray::new(config.thread_capacity, |_| {
            Row(UnsafeCell::new(ThreadCache::new()))
        })?;
        let stats = MappedArray::new(config.thread_capacity, |_| CallStats::new())?;
        Ok(Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            classifier,
            rows,
            stats,
            pool: OverflowPool::new(config.shard_partitions)?,
            registry: ThreadRegistry::new(config.thread_capacity),
            metrics: EngineMetrics::new(),
            events: LifecycleLog::for_verbosity(config.verbose),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &SizeClassifier<MappedArray<LearnEntry>> {
        &self.classifier
    }

    /// Allocate/release counts summed over every row.
    pub fn stats(&self) -> CallStatsSnapshot {
        CallStatsSnapshot::aggregate(self.stats.iter())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.events.lifecycle_logs()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.events.drain_lifecycle_logs()
    }

    pub fn record_event(&self, event: LifecycleEvent) -> Option<u64> {
        self.events.record(event)
    }

    /// Full segments of `class` waiting in the overflow pool.
    pub fn shard_segments(&self, class: usize) -> usize {
        self.pool.segments_in(class)
    }

    /// Thread indices currently claimed.
    pub fn active_threads(&self) -> usize {
        self.registry.active()
    }

    // ---- thread attachment ----

    /// Claim the reserved main-thread index.
    pub fn attach_main(&self) -> Result<ThreadContext<'_>, MallocError> {
        let index = self.claim_main_index()?;
        Ok(ThreadContext::new(self, index))
    }

    /// Claim a worker index.
    pub fn attach(&self) -> Result<ThreadContext<'_>, MallocError> {
        let index = self.claim_index()?;
        Ok(ThreadContext::new(self, index))
    }

    pub fn claim_main_index(&self) -> Result<usize, MallocError> {
        let index = self.registry.claim_main()?;
        self.events
            .record(LifecycleEvent::new(LogLevel::Info, "main_init", "attach").thread(index));
        Ok(index)
    }

    pub fn claim_index(&self) -> Result<usize, MallocError> {
        let index = self.registry.claim()?;
        self.events
            .record(LifecycleEvent::new(LogLevel::Info, "thread_init", "attach").thread(index));
        Ok(index)
    }

    /// Release `index`: unmap the row's unused reservation and free the slot.
    ///
    /// Cached chunks stay in the row for whichever thread claims it next.
    ///
    /// # Safety
    ///
    /// The caller must hold `index` and must not use it afterwards.
    pub unsafe fn detach(&self, index: usize) -> Result<(), MallocError> {
        // SAFETY: caller holds `index`.
        let cache = unsafe { self.cache_row(index) };
        let cached = cache.cached_chunks();
        let result = cache.region_mut().release_all(&self.metrics);
        self.registry.release(index);
        self.events.record(
            LifecycleEvent::new(LogLevel::Info, "thread_term", "detach")
                .thread(index)
                .outcome(if result.is_ok() { "ok" } else { "unmap_failed" })
                .detail(cached as u64),
        );
        result
    }

    /// The cache row for `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold `index` (from `claim_index`/`claim_main_index`)
    /// and must not let two borrows of the same row overlap.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn cache_row(&self, index: usize) -> &mut ThreadCache {
        // SAFETY: exclusive by the index-ownership contract above.
        unsafe { &mut *self.rows[index].0.get() }
    }

    // ---- tiers ----

    fn classify(&self, index: usize, size: usize) -> usize {
        let c = self.classifier.observe(size);
        match c.event {
            Some(LearnEvent::Assigned {
                class,
                lower,
                boundary,
            }) => {
                EngineMetrics::inc(&self.metrics.learned_classes);
                self.events.record(
                    LifecycleEvent::new(LogLevel::Info, "allocate", "learned_class")
                        .class(class)
                        .size(boundary)
                        .thread(index)
                        .detail(lower as u64),
                );
            }
            Some(LearnEvent::SlotsExhausted { size }) => {
                self.events.record(
                    LifecycleEvent::new(LogLevel::Warn, "allocate", "learned_slots_exhausted")
                        .size(size)
                        .thread(index)
                        .outcome("fallback"),
                );
            }
            None => {}
        }
        c.class
    }

    fn allocate_chunk(
        &self,
        index: usize,
        cache: &mut ThreadCache,
        size: usize,
    ) -> Result<Chunk, MallocError> {
        if size > MAX_REQUEST_SIZE {
            return Err(MallocError::RequestTooLarge { size });
        }
        self.stats[index].record_malloc(size);
        let class = self.classify(index, size);
        if let Some(chunk) = cache.pop(class) {
            return Ok(chunk);
        }

        EngineMetrics::inc(&self.metrics.shard_probes);
        if let Some(seg) = self.pool.adopt(class, index, &self.metrics) {
            cache.push_segment(class, seg, &self.metrics)?;
            self.events.record(
                LifecycleEvent::new(LogLevel::Debug, "allocate", "segment_adopt")
                    .class(class)
                    .thread(index),
            );
            if let Some(chunk) = cache.pop(class) {
                return Ok(chunk);
            }
        }

        let class = self.refill(index, cache, size)?;
        cache
            .pop(class)
            .ok_or(MallocError::RefillExhausted { class })
    }

    /// Carve a batch of chunks for `size` into the local cache. Returns the
    /// class refilled, which may be a learned class assigned since the
    /// first lookup.
    fn refill(
        &self,
        index: usize,
        cache: &mut ThreadCache,
        size: usize,
    ) -> Result<usize, MallocError> {
        let class = self.classifier.classify(size);
        let class_bytes = self.classifier.class_size(class);
        let too_large = MallocError::RequestTooLarge { size };
        let unit = unit_size(class_bytes).ok_or(too_large)?;
        let n = cache.next_refill_count(class, class_bytes);
        let span = unit
            .checked_mul(n)
            .and_then(|b| checked_align_up(b, PAGE_SIZE))
            .ok_or(too_large)?;
        let base = cache.region_mut().acquire(span, &self.metrics)?;
        for i in (0..n).rev() {
            // SAFETY: unit `i` lies inside the span just acquired, which
            // nothing else references; units are 16-byte multiples from a
            // page-aligned base.
            let chunk = unsafe { Chunk::construct(base.add(i * unit), class_bytes, class) };
            cache.push(class, chunk, &self.metrics)?;
        }
        EngineMetrics::inc(&self.metrics.bulk_refills);
        EngineMetrics::add(&self.metrics.chunks_carved, n as u64);
        self.events.record(
            LifecycleEvent::new(LogLevel::Trace, "allocate", "bulk_refill")
                .class(class)
                .size(class_bytes)
                .thread(index)
                .detail(n as u64),
        );
        Ok(class)
    }

    fn release_chunk(
        &self,
        index: usize,
        cache: &mut ThreadCache,
        mut chunk: Chunk,
    ) -> Result<(), MallocError> {
        chunk.verify()?;
        self.stats[index].record_free(chunk.size());
        chunk.clear_alignment();
        let class = chunk.class();

        let segments = cache.stack(class).segment_count();
        if should_offload(segments, chunk.size()) {
            let mut moved = 0u64;
            for _ in 0..offload_count(segments) {
                let Some(seg) = cache.pop_mid_segment(class) else {
                    break;
                };
                self.pool
                    .offload(seg, class, index, cache.region_mut(), &self.metrics)?;
                moved += 1;
            }
            self.events.record(
                LifecycleEvent::new(LogLevel::Debug, "release", "segment_offload")
                    .class(class)
                    .thread(index)
                    .detail(moved),
            );
        }
        cache.push(class, chunk, &self.metrics)
    }

    fn aligned_chunk(
        &self,
        index: usize,
        cache: &mut ThreadCache,
        alignment: usize,
        size: usize,
    ) -> Result<Chunk, MallocError> {
        if !alignment.is_power_of_two() {
            return Err(MallocError::InvalidAlignment { alignment });
        }
        let padded = size
            .checked_add(alignment)
            .ok_or(MallocError::RequestTooLarge { size })?;
        let mut chunk = self.allocate_chunk(index, cache, padded)?;
        chunk.set_alignment(alignment);
        Ok(chunk)
    }

    // ---- raw-pointer surface ----

    /// `malloc`: zero bytes yield null.
    ///
    /// # Safety
    ///
    /// The caller must hold `index`.
    pub unsafe fn malloc(&self, index: usize, size: usize) -> Result<*mut u8, MallocError> {
        if size == 0 {
            return Ok(ptr::null_mut());
        }
        // SAFETY: caller holds `index`.
        let cache = unsafe { self.cache_row(index) };
        Ok(self.allocate_chunk(index, cache, size)?.data_ptr().as_ptr())
    }

    /// `free`: null is a no-op.
    ///
    /// # Safety
    ///
    /// The caller must hold `index`, and `ptr` must be null or a live pointer
    /// returned by this engine.
    pub unsafe fn free(&self, index: usize, ptr: *mut u8) -> Result<(), MallocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        // SAFETY: caller guarantees `ptr` came from this engine.
        let chunk = unsafe { Chunk::from_data_ptr(ptr) };
        // SAFETY: caller holds `index`.
        let cache = unsafe { self.cache_row(index) };
        self.release_chunk(index, cache, chunk)
    }

    /// `calloc`: a zero count or size yields null.
    ///
    /// # Safety
    ///
    /// The caller must hold `index`.
    pub unsafe fn calloc(
        &self,
        index: usize,
        count: usize,
        size: usize,
    ) -> Result<*mut u8, MallocError> {
        if count == 0 || size == 0 {
            return Ok(ptr::null_mut());
        }
        let total = count
            .checked_mul(size)
            .ok_or(MallocError::RequestTooLarge { size: usize::MAX })?;
        // SAFETY: caller holds `index`.
        let p = unsafe { self.malloc(index, total)? };
        // SAFETY: `p` has at least `total` usable bytes.
        unsafe { p.write_bytes(0, total) };
        Ok(p)
    }

    /// `realloc`: never moves on shrink, copies the old usable bytes on grow.
    ///
    /// # Safety
    ///
    /// As for [`Engine::free`].
    pub unsafe fn realloc(
        &self,
        index: usize,
        ptr: *mut u8,
        size: usize,
    ) -> Result<*mut u8, MallocError> {
        let Some(old) = NonNull::new(ptr) else {
            // SAFETY: forwarded contract.
            return unsafe { self.malloc(index, size) };
        };
        if size == 0 {
            // SAFETY: forwarded contract.
            unsafe { self.free(index, ptr)? };
            return Ok(ptr::null_mut());
        }
        // SAFETY: caller guarantees `ptr` came from this engine.
        let chunk = unsafe { Chunk::from_data_ptr(old) };
        chunk.verify()?;
        let usable = chunk.usable_size();
        if size <= usable {
            return Ok(ptr);
        }
        // SAFETY: caller holds `index`.
        let cache = unsafe { self.cache_row(index) };
        let fresh = self.allocate_chunk(index, cache, size)?;
        // SAFETY: distinct chunks; the new one holds more than `usable` bytes.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.data_ptr().as_ptr(), usable) };
        self.release_chunk(index, cache, chunk)?;
        Ok(fresh.data_ptr().as_ptr())
    }

    /// Aligned allocation: zero bytes yield null.
    ///
    /// # Safety
    ///
    /// The caller must hold `index`.
    pub unsafe fn memalign(
        &self,
        index: usize,
        alignment: usize,
        size: usize,
    ) -> Result<*mut u8, MallocError> {
        if size == 0 {
            return Ok(ptr::null_mut());
        }
        // SAFETY: caller holds `index`.
        let cache = unsafe { self.cache_row(index) };
        Ok(self
            .aligned_chunk(index, cache, alignment, size)?
            .data_ptr()
            .as_ptr())
    }

    /// `posix_memalign`: stores the result in `out`, null for zero bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold `index`; `out` must be valid for a write.
    pub unsafe fn posix_memalign(
        &self,
        index: usize,
        out: *mut *mut u8,
        alignment: usize,
        size: usize,
    ) -> Result<(), MallocError> {
        // SAFETY: forwarded contract.
        let p = unsafe { self.memalign(index, alignment, size)? };
        // SAFETY: caller guarantees `out` is writable.
        unsafe { out.write(p) };
        Ok(())
    }

    /// Bytes usable at `ptr`, 0 for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this engine.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        match NonNull::new(ptr) {
            // SAFETY: caller guarantees `ptr` came from this engine.
            Some(p) => unsafe { Chunk::from_data_ptr(p) }.usable_size(),
            None => 0,
        }
    }

    /// Serve `size` bytes from a dedicated mapping, bypassing every cache.
    ///
    /// Used when the allocator is re-entered on a thread that is already
    /// inside it. The result is an ordinary base-class chunk, so a later
    /// release recycles it like any other.
    pub fn allocate_detached(&self, size: usize) -> Result<*mut u8, MallocError> {
        Ok(self.detached_chunk(size)?.data_ptr().as_ptr())
    }

    /// [`Engine::allocate_detached`] honouring `alignment`.
    pub fn allocate_detached_aligned(
        &self,
        alignment: usize,
        size: usize,
    ) -> Result<*mut u8, MallocError> {
        if !alignment.is_power_of_two() {
            return Err(MallocError::InvalidAlignment { alignment });
        }
        let padded = size
            .checked_add(alignment)
            .ok_or(MallocError::RequestTooLarge { size })?;
        let mut chunk = self.detached_chunk(padded)?;
        chunk.set_alignment(alignment);
        Ok(chunk.data_ptr().as_ptr())
    }

    fn detached_chunk(&self, size: usize) -> Result<Chunk, MallocError> {
        if size > MAX_REQUEST_SIZE {
            return Err(MallocError::RequestTooLarge { size });
        }
        let class = size_class::class_of(size.max(1));
        let class_bytes = size_class::class_size(class);
        let too_large = MallocError::RequestTooLarge { size };
        let len = unit_size(class_bytes)
            .and_then(|u| checked_align_up(u, PAGE_SIZE))
            .ok_or(too_large)?;
        let base = os::map(len)?;
        EngineMetrics::inc(&self.metrics.detached_chunks);
        // SAFETY: a fresh page-aligned mapping of at least one unit.
        Ok(unsafe { Chunk::construct(base, class_bytes, class) })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for row in self.rows.iter() {
            // SAFETY: `&mut self` rules out any other borrow of a row.
            let cache = unsafe { &mut *row.0.get() };
            if let Err(err) = cache.region_mut().release_all(&self.metrics) {
                crate::fatal::fatal(&err);
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("learned", &self.classifier.learned_count())
            .finish_non_exhaustive()
    }
}

/// A thread's claim on one cache-matrix row.
///
/// Dropping the context is thread teardown: the row's reservation is
/// unmapped and its index returned.
pub struct ThreadContext<'e> {
    engine: &'e Engine,
    index: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<'e> ThreadContext<'e> {
    fn new(engine: &'e Engine, index: usize) -> Self {
        Self {
            engine,
            index,
            _not_send: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    fn cache(&mut self) -> &mut ThreadCache {
        // SAFETY: this context holds `index`, is not `Send`, and `&mut self`
        // keeps the borrow unique.
        unsafe { self.engine.cache_row(self.index) }
    }

    fn wrap(&self, chunk: Chunk) -> Allocation {
        Allocation {
            chunk,
            engine: self.engine.id,
        }
    }

    fn check_owner(&self, a: &Allocation) -> Result<(), MallocError> {
        if a.engine != self.engine.id {
            return Err(MallocError::ForeignAllocation {
                owner: a.engine,
                engine: self.engine.id,
            });
        }
        Ok(())
    }

    /// Allocate at least `size` bytes. Zero is served as the smallest class.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation, MallocError> {
        let (engine, index) = (self.engine, self.index);
        let chunk = engine.allocate_chunk(index, self.cache(), size.max(1))?;
        Ok(self.wrap(chunk))
    }

    pub fn release(&mut self, a: Allocation) -> Result<(), MallocError> {
        self.check_owner(&a)?;
        let (engine, index) = (self.engine, self.index);
        engine.release_chunk(index, self.cache(), a.chunk)
    }

    /// Grow `a` to `size` bytes; shrinking hands `a` back untouched.
    pub fn reallocate(&mut self, a: Allocation, size: usize) -> Result<Allocation, MallocError> {
        self.check_owner(&a)?;
        if size <= a.usable_size() {
            return Ok(a);
        }
        let mut fresh = self.allocate(size)?;
        fresh.as_mut_slice()[..a.usable_size()].copy_from_slice(a.as_slice());
        self.release(a)?;
        Ok(fresh)
    }

    pub fn allocate_aligned(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Result<Allocation, MallocError> {
        let (engine, index) = (self.engine, self.index);
        let chunk = engine.aligned_chunk(index, self.cache(), alignment, size.max(1))?;
        Ok(self.wrap(chunk))
    }

    /// Chunks of `class` cached by this thread.
    pub fn cached(&mut self, class: usize) -> usize {
        self.cache().stack(class).len()
    }

    /// Segments linked in this thread's stack for `class`.
    pub fn cached_segments(&mut self, class: usize) -> usize {
        self.cache().stack(class).segment_count()
    }
}

impl Drop for ThreadContext<'_> {
    fn drop(&mut self) {
        // SAFETY: this context holds `index` and is going away.
        if let Err(err) = unsafe { self.engine.detach(self.index) } {
            crate::fatal::fatal(&err);
        }
    }
}

/// An owned block handed out by a [`ThreadContext`].
///
/// The block stays valid until released. Dropping an `Allocation` without
/// releasing it leaks the block.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    chunk: Chunk,
    engine: u32,
}

impl Allocation {
    pub fn usable_size(&self) -> usize {
        self.chunk.usable_size()
    }

    pub fn class_index(&self) -> usize {
        self.chunk.class()
    }

    /// Size of the block's class, ignoring alignment padding.
    pub fn class_size(&self) -> usize {
        self.chunk.size()
    }

    pub fn addr(&self) -> usize {
        self.chunk.data_ptr().as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.chunk.data_ptr().as_ptr()
    }

    /// Header address recovered from the data pointer alone.
    pub fn header_addr(&self) -> usize {
        // SAFETY: the data pointer of a live chunk.
        unsafe { Chunk::from_data_ptr(self.chunk.data_ptr()) }.header_addr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the payload is `usable_size` initialized bytes (mapped
        // zeroed, then only ever written) owned by this handle.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.usable_size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe {
            std::slice::from_raw_parts_mut(self.chunk.data_ptr().as_ptr(), self.usable_size())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmalloc_core::layout::SEGMENT_CAPACITY;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_thread_capacity(8)).unwrap()
    }

    #[test]
    fn test_allocate_release_reuses_chunk() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let a = ctx.allocate(100).unwrap();
        let addr = a.addr();
        assert!(a.usable_size() >= 100);
        ctx.release(a).unwrap();
        let b = ctx.allocate(100).unwrap();
        assert_eq!(b.addr(), addr);
        ctx.release(b).unwrap();
    }

    #[test]
    fn test_first_miss_refills_once() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(ctx.allocate(32).unwrap());
        }
        let m = e.metrics();
        assert_eq!(m.bulk_refills, 1);
        assert_eq!(m.shard_probes, 1);
        assert_eq!(m.chunks_carved, 32);
        // Back-to-front construction hands out ascending addresses.
        assert!(held.windows(2).all(|w| w[0].addr() < w[1].addr()));
        for a in held {
            ctx.release(a).unwrap();
        }
    }

    #[test]
    fn test_payloads_do_not_overlap_headers() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let mut held = Vec::new();
        for i in 0..64 {
            let mut a = ctx.allocate(48).unwrap();
            a.as_mut_slice().fill(i as u8);
            held.push(a);
        }
        for (i, a) in held.iter().enumerate() {
            assert!(a.as_slice().iter().all(|&b| b == i as u8));
        }
        for a in held {
            ctx.release(a).unwrap();
        }
    }

    #[test]
    fn test_reallocate_shrink_keeps_block() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let a = ctx.allocate(200).unwrap();
        let addr = a.addr();
        let a = ctx.reallocate(a, 200).unwrap();
        assert_eq!(a.addr(), addr);
        let a = ctx.reallocate(a, 199).unwrap();
        assert_eq!(a.addr(), addr);
        ctx.release(a).unwrap();
    }

    #[test]
    fn test_reallocate_grow_copies() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let mut a = ctx.allocate(16).unwrap();
        a.as_mut_slice().copy_from_slice(b"0123456789abcdef");
        let b = ctx.reallocate(a, 5000).unwrap();
        assert!(b.usable_size() >= 5000);
        assert_eq!(&b.as_slice()[..16], b"0123456789abcdef");
        ctx.release(b).unwrap();
    }

    #[test]
    fn test_aligned_allocation() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let a = ctx.allocate_aligned(64, 100).unwrap();
        assert_eq!(a.addr() % 64, 0);
        assert!(a.usable_size() >= 100);
        assert_eq!(a.header_addr(), a.addr() - a.chunk.offset() - 32);
        ctx.release(a).unwrap();
        assert_eq!(
            ctx.allocate_aligned(48, 10),
            Err(MallocError::InvalidAlignment { alignment: 48 })
        );
    }

    #[test]
    fn test_release_into_other_engine_is_rejected() {
        let e1 = engine();
        let e2 = engine();
        let mut c1 = e1.attach().unwrap();
        let mut c2 = e2.attach().unwrap();
        let a = c1.allocate(10).unwrap();
        assert!(matches!(
            c2.release(a),
            Err(MallocError::ForeignAllocation { .. })
        ));
    }

    #[test]
    fn test_oversize_request() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        assert_eq!(
            ctx.allocate(MAX_REQUEST_SIZE + 1),
            Err(MallocError::RequestTooLarge {
                size: MAX_REQUEST_SIZE + 1
            })
        );
    }

    #[test]
    fn test_detach_frees_index() {
        let e = Engine::new(EngineConfig::default().with_thread_capacity(2)).unwrap();
        {
            let _ctx = e.attach().unwrap();
            assert!(matches!(
                e.attach(),
                Err(MallocError::ThreadSlotsExhausted { .. })
            ));
        }
        assert!(e.attach().is_ok());
        let events: Vec<_> = e.lifecycle_logs().iter().map(|r| r.event).collect();
        assert!(events.contains(&"detach"));
    }

    #[test]
    fn test_quiet_engine_skips_refill_records() {
        let quiet = engine();
        let verbose = Engine::new(
            EngineConfig::default()
                .with_thread_capacity(8)
                .with_verbose(true),
        )
        .unwrap();
        for e in [&quiet, &verbose] {
            let mut ctx = e.attach().unwrap();
            let a = ctx.allocate(64).unwrap();
            ctx.release(a).unwrap();
            assert_eq!(e.metrics().bulk_refills, 1);
        }
        let events = |e: &Engine| -> Vec<&'static str> {
            e.lifecycle_logs().iter().map(|r| r.event).collect()
        };
        assert!(!events(&quiet).contains(&"bulk_refill"));
        assert!(events(&quiet).contains(&"attach"));
        assert!(events(&verbose).contains(&"bulk_refill"));
        assert!(
            quiet
                .lifecycle_logs()
                .iter()
                .all(|r| r.level >= LogLevel::Info)
        );
    }

    #[test]
    fn test_raw_surface() {
        let e = engine();
        let index = e.claim_index().unwrap();
        // SAFETY: `index` is held for the whole test and every pointer comes
        // from `e`.
        unsafe {
            assert!(e.malloc(index, 0).unwrap().is_null());
            let p = e.malloc(index, 40).unwrap();
            assert!(!p.is_null());
            assert!(e.usable_size(p) >= 40);

            let z = e.calloc(index, 10, 10).unwrap();
            assert!(std::slice::from_raw_parts(z, 100).iter().all(|&b| b == 0));
            assert!(e.calloc(index, 0, 10).unwrap().is_null());
            assert!(e.calloc(index, usize::MAX, 2).is_err());

            let q = e.realloc(index, p, 30).unwrap();
            assert_eq!(q, p);
            let r = e.realloc(index, q, 4000).unwrap();
            assert!(e.usable_size(r) >= 4000);
            assert!(e.realloc(index, r, 0).unwrap().is_null());

            let mut out = ptr::null_mut();
            e.posix_memalign(index, &mut out, 256, 10).unwrap();
            assert_eq!(out as usize % 256, 0);
            e.free(index, out).unwrap();
            e.posix_memalign(index, &mut out, 256, 0).unwrap();
            assert!(out.is_null());

            e.free(index, z).unwrap();
            e.free(index, ptr::null_mut()).unwrap();
            e.detach(index).unwrap();
        }
    }

    #[test]
    fn test_detached_chunk_recycles() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let index = ctx.index();
        let p = e.allocate_detached(100).unwrap();
        assert_eq!(e.metrics().detached_chunks, 1);
        // SAFETY: `p` came from `e`, and `ctx` is not used while the raw
        // call borrows the row.
        unsafe {
            assert_eq!(e.usable_size(p), 128);
            e.free(index, p).unwrap();
        }
        assert_eq!(ctx.cached(size_class::class_of(100)), 1);
    }

    #[test]
    fn test_detached_aligned() {
        let e = engine();
        let p = e.allocate_detached_aligned(4096, 10).unwrap();
        assert_eq!(p as usize % 4096, 0);
        // SAFETY: `p` came from `e`.
        unsafe { assert!(e.usable_size(p) >= 10) };
        assert!(matches!(
            e.allocate_detached_aligned(24, 10),
            Err(MallocError::InvalidAlignment { alignment: 24 })
        ));
    }

    #[test]
    fn test_offload_sheds_half_the_backlog() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let size = 64 * 1024;
        let class = size_class::class_of(size);
        let held: Vec<_> = (0..SEGMENT_CAPACITY + 2)
            .map(|_| ctx.allocate(size).unwrap())
            .collect();
        for a in held {
            ctx.release(a).unwrap();
        }
        assert_eq!(e.shard_segments(class), 1);
        assert_eq!(e.metrics().shard_offloads, 1);
        assert_eq!(ctx.cached_segments(class), 1);
    }

    #[test]
    fn test_stats_count_calls() {
        let e = engine();
        let mut ctx = e.attach().unwrap();
        let a = ctx.allocate(100).unwrap();
        let b = ctx.allocate(1000).unwrap();
        ctx.release(a).unwrap();
        let s = e.stats();
        assert_eq!(s.total_malloc(), 2);
        assert_eq!(s.total_free(), 1);
        assert_eq!(s.malloc[7], 1);
        assert_eq!(s.free[7], 1);
        ctx.release(b).unwrap();
    }
}
