//! Size classification with runtime-learned classes.
//!
//! Requests are first mapped onto the base scheme of [`crate::size_class`].
//! Sizes that are not powers of two are also counted, keyed by the size
//! rounded up to [`SAMPLE_STRIDE`]. When a key has been seen
//! [`LEARN_THRESHOLD`] times and a learned slot is still free, the key becomes
//! the upper boundary of a new class covering every key between the closest
//! lower boundary (a base class or an earlier learned class) and itself.
//!
//! Reads are lock-free. The only lock is taken while a slot is assigned, which
//! happens at most [`NUM_LEARNED_CLASSES`] times per classifier.
//!
//! Every table entry is written at most once, from 0 to its final class, so a
//! reader can never observe a mapping that later changes.

use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::MallocError;
use crate::size_class::{
    self, MAX_REQUEST_SIZE, MIN_SIZE, NUM_BASE_CLASSES, NUM_LEARNED_CLASSES, NUM_SIZE_CLASSES,
};

/// Granularity of the counting table.
pub const SAMPLE_STRIDE: usize = 8;

/// Observations of one key before it may become a class.
pub const LEARN_THRESHOLD: u16 = 10;

/// Sizes at or above this are never learned.
pub const LEARNABLE_LIMIT: usize = 4 * 1024 * 1024;

/// Entries in the counting table.
pub const LEARN_TABLE_LEN: usize = LEARNABLE_LIMIT / SAMPLE_STRIDE;

/// One counting-table entry. All-zero is the initial state, so a zero-filled
/// mapping is a valid table.
#[derive(Debug, Default)]
#[repr(C)]
pub struct LearnEntry {
    /// Learned slot + 1, or 0 while unmapped.
    slot: AtomicU8,
    _pad: u8,
    seen: AtomicU16,
}

impl LearnEntry {
    pub const fn new() -> Self {
        Self {
            slot: AtomicU8::new(0),
            _pad: 0,
            seen: AtomicU16::new(0),
        }
    }
}

/// Something the classifier did while classifying, worth logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnEvent {
    /// A new class was created for `(lower, boundary]`.
    Assigned {
        class: usize,
        lower: usize,
        boundary: usize,
    },
    /// `size` reached the threshold but every slot was taken.
    SlotsExhausted { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: usize,
    pub event: Option<LearnEvent>,
}

impl Classification {
    const fn plain(class: usize) -> Self {
        Self { class, event: None }
    }
}

/// Base + learned classifier.
///
/// The counting table is supplied by the caller so the runtime can back it
/// with an anonymous mapping instead of the heap.
pub struct SizeClassifier<S = Box<[LearnEntry]>> {
    table: S,
    boundaries: [AtomicUsize; NUM_LEARNED_CLASSES],
    assigned: AtomicUsize,
    assign_lock: Mutex<()>,
}

impl SizeClassifier<Box<[LearnEntry]>> {
    /// Classifier with a heap-allocated table.
    pub fn boxed() -> Self {
        let table: Box<[LearnEntry]> = (0..LEARN_TABLE_LEN).map(|_| LearnEntry::new()).collect();
        Self::from_parts(table)
    }
}

impl<S: Deref<Target = [LearnEntry]>> SizeClassifier<S> {
    /// Build over an existing zeroed table of exactly [`LEARN_TABLE_LEN`] entries.
    pub fn with_table(table: S) -> Result<Self, MallocError> {
        if table.len() != LEARN_TABLE_LEN {
            return Err(MallocError::TableSizeMismatch {
                expected: LEARN_TABLE_LEN,
                found: table.len(),
            });
        }
        Ok(Self::from_parts(table))
    }

    fn from_parts(table: S) -> Self {
        Self {
            table,
            boundaries: [const { AtomicUsize::new(0) }; NUM_LEARNED_CLASSES],
            assigned: AtomicUsize::new(0),
            assign_lock: Mutex::new(()),
        }
    }

    /// Current class for `size`, without counting it.
    #[inline]
    pub fn classify(&self, size: usize) -> usize {
        match learn_key(size) {
            Some(key) => self.mapped(key).unwrap_or_else(|| size_class::class_of(size)),
            None => size_class::class_of(size),
        }
    }

    /// Classify `size` and count it toward learning.
    pub fn observe(&self, size: usize) -> Classification {
        let Some(key) = learn_key(size) else {
            return Classification::plain(size_class::class_of(size));
        };
        if let Some(class) = self.mapped(key) {
            return Classification::plain(class);
        }
        let entry = &self.table[key];
        if entry.seen.load(Ordering::Relaxed) < LEARN_THRESHOLD {
            let seen = entry.seen.fetch_add(1, Ordering::Relaxed) + 1;
            if seen < LEARN_THRESHOLD {
                return Classification::plain(size_class::class_of(size));
            }
            if self.assigned.load(Ordering::Relaxed) >= NUM_LEARNED_CLASSES {
                let mut c = Classification::plain(size_class::class_of(size));
                if seen == LEARN_THRESHOLD {
                    c.event = Some(LearnEvent::SlotsExhausted { size });
                }
                return c;
            }
        } else if self.assigned.load(Ordering::Relaxed) >= NUM_LEARNED_CLASSES {
            return Classification::plain(size_class::class_of(size));
        }
        self.learn(key)
    }

    /// Usable bytes of `class`. Unassigned learned classes report 0.
    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        if class < NUM_BASE_CLASSES {
            size_class::class_size(class)
        } else if class < NUM_SIZE_CLASSES {
            self.boundaries[class - NUM_BASE_CLASSES].load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Number of learned classes assigned so far.
    pub fn learned_count(&self) -> usize {
        self.assigned.load(Ordering::Acquire)
    }

    /// Boundaries of the learned classes, in slot order.
    pub fn learned_boundaries(&self) -> impl Iterator<Item = usize> + '_ {
        self.boundaries[..self.learned_count()]
            .iter()
            .map(|b| b.load(Ordering::Acquire))
    }

    #[inline]
    fn mapped(&self, key: usize) -> Option<usize> {
        match self.table[key].slot.load(Ordering::Acquire) {
            0 => None,
            slot => Some(NUM_BASE_CLASSES + usize::from(slot) - 1),
        }
    }

    #[cold]
    fn learn(&self, key: usize) -> Classification {
        let boundary = key * SAMPLE_STRIDE;
        let _guard = self.assign_lock.lock();
        if let Some(class) = self.mapped(key) {
            return Classification::plain(class);
        }
        let slot = self.assigned.load(Ordering::Relaxed);
        if slot >= NUM_LEARNED_CLASSES {
            return Classification::plain(size_class::class_of(boundary));
        }

        let mut lower = size_class::class_size(size_class::class_of(boundary) - 1);
        for b in &self.boundaries[..slot] {
            let b = b.load(Ordering::Relaxed);
            if b < boundary && b > lower {
                lower = b;
            }
        }

        self.boundaries[slot].store(boundary, Ordering::Release);
        let tag = (slot + 1) as u8;
        for entry in &self.table[lower / SAMPLE_STRIDE + 1..=key] {
            entry.slot.store(tag, Ordering::Release);
        }
        self.assigned.store(slot + 1, Ordering::Release);

        let class = NUM_BASE_CLASSES + slot;
        Classification {
            class,
            event: Some(LearnEvent::Assigned {
                class,
                lower,
                boundary,
            }),
        }
    }
}

impl<S> std::fmt::Debug for SizeClassifier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassifier")
            .field("assigned", &self.assigned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Counting-table key for `size`, or `None` when the size is never learned.
#[inline]
fn learn_key(size: usize) -> Option<usize> {
    if size <= MIN_SIZE || size >= LEARNABLE_LIMIT || size > MAX_REQUEST_SIZE {
        return None;
    }
    let rounded = size.next_multiple_of(SAMPLE_STRIDE);
    if size.is_power_of_two() || rounded.is_power_of_two() || rounded >= LEARNABLE_LIMIT {
        return None;
    }
    Some(rounded / SAMPLE_STRIDE)
}
