//! Base size classes.
//!
//! The default scheme rounds every request up to the next power of two, with
//! 8 bytes as the smallest class. Building with `half-step-classes` splits each
//! octave at 1.5x, so `12`, `24`, `48`, ... become classes of their own.
//!
//! Learned classes (see [`crate::classifier`]) are numbered after the base
//! classes, giving a combined index space of [`NUM_SIZE_CLASSES`].

/// Smallest request size that gets its own class. Anything smaller is served
/// from the 8-byte class.
pub const MIN_SIZE: usize = 8;

/// Number of base classes.
#[cfg(not(feature = "half-step-classes"))]
pub const NUM_BASE_CLASSES: usize = 65;
#[cfg(feature = "half-step-classes")]
pub const NUM_BASE_CLASSES: usize = 129;

/// Number of classes the classifier may learn at runtime.
pub const NUM_LEARNED_CLASSES: usize = 32;

/// Combined class index space.
pub const NUM_SIZE_CLASSES: usize = NUM_BASE_CLASSES + NUM_LEARNED_CLASSES;

/// Largest request the engine accepts. Nothing bigger fits in a 47-bit user
/// address space anyway.
pub const MAX_REQUEST_SIZE: usize = 1 << 46;

/// `max(1, ceil(log2(size)))`.
///
/// This is also the bucket index used by the call statistics.
#[inline]
pub const fn roundup_log2(size: usize) -> usize {
    if size <= 2 {
        1
    } else {
        (usize::BITS - (size - 1).leading_zeros()) as usize
    }
}

/// Base class for `size`.
#[cfg(not(feature = "half-step-classes"))]
#[inline]
pub const fn class_of(size: usize) -> usize {
    if size <= MIN_SIZE {
        3
    } else {
        roundup_log2(size)
    }
}

/// Base class for `size`.
#[cfg(feature = "half-step-classes")]
#[inline]
pub const fn class_of(size: usize) -> usize {
    let size = if size < MIN_SIZE { MIN_SIZE } else { size };
    let r = roundup_log2(size);
    let v = 1usize << r;
    if size <= v - v / 4 { r * 2 - 1 } else { r * 2 }
}

/// Usable byte size of base class `index`. Returns 0 for indices whose size
/// does not fit in a `usize`.
#[cfg(not(feature = "half-step-classes"))]
#[inline]
pub const fn class_size(index: usize) -> usize {
    if index >= usize::BITS as usize {
        0
    } else {
        1 << index
    }
}

/// Usable byte size of base class `index`. Returns 0 for indices whose size
/// does not fit in a `usize`.
#[cfg(feature = "half-step-classes")]
#[inline]
pub const fn class_size(index: usize) -> usize {
    if index / 2 >= usize::BITS as usize - 1 {
        return 0;
    }
    let v = 1usize << (index / 2);
    v + v / 2 * (index % 2)
}

/// True when `index` names a learned class rather than a base one.
#[inline]
pub const fn is_learned(index: usize) -> bool {
    index >= NUM_BASE_CLASSES && index < NUM_SIZE_CLASSES
}
