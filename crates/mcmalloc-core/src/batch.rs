//! How much memory moves at once.
//!
//! Three knobs live here:
//! - how large an OS mapping the region supplier requests,
//! - how many chunks a cache refill carves,
//! - when a thread cache sheds segments to the overflow pool.

use crate::layout::{PAGE_SIZE, SEGMENT_CAPACITY, checked_align_up};

#[cfg(not(feature = "no-batch"))]
pub const REGION_BATCH_MULTIPLIER: usize = 16;
#[cfg(not(feature = "no-batch"))]
pub const REGION_BATCH_MIN: usize = 2 * 1024 * 1024;
#[cfg(not(feature = "no-batch"))]
pub const REGION_BATCH_MAX: usize = 64 * 1024 * 1024;

#[cfg(feature = "no-batch")]
pub const REGION_BATCH_MULTIPLIER: usize = 1;
#[cfg(feature = "no-batch")]
pub const REGION_BATCH_MIN: usize = 1;
#[cfg(feature = "no-batch")]
pub const REGION_BATCH_MAX: usize = 1;

/// Upper bound on `count * class_bytes` for one cache refill.
pub const MAX_REFILL_BYTES: usize = 1024 * 1024;

/// Classes up to this size always carve at least [`MIN_REFILL_CHUNKS`].
pub const REFILL_FLOOR_CLASS_BYTES: usize = 256 * 1024;

pub const MIN_REFILL_CHUNKS: usize = 32;

/// Buffered bytes in one thread cache class before it sheds segments.
pub const OFFLOAD_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;

/// Length of the OS mapping made when a reservation cannot satisfy `length`.
///
/// `clamp(length * 16, 2 MiB, 64 MiB)`, never less than `length`, rounded up
/// to whole pages.
pub fn region_batch_len(length: usize) -> usize {
    let batch = length
        .saturating_mul(REGION_BATCH_MULTIPLIER)
        .clamp(REGION_BATCH_MIN, REGION_BATCH_MAX)
        .max(length);
    checked_align_up(batch, PAGE_SIZE).unwrap_or(batch)
}

/// Next refill size for a class, given the count used by the previous refill
/// (0 before the first).
///
/// Doubles each time, backs off while the refill would exceed
/// [`MAX_REFILL_BYTES`], and never drops under [`MIN_REFILL_CHUNKS`] for
/// classes up to [`REFILL_FLOOR_CLASS_BYTES`].
pub fn next_refill_count(previous: usize, class_bytes: usize) -> usize {
    let mut n = previous.saturating_mul(2);
    while n > 1 && n.saturating_mul(class_bytes) > MAX_REFILL_BYTES {
        n >>= 1;
    }
    let mut n = n.max(1);
    if class_bytes <= REFILL_FLOOR_CLASS_BYTES && n < MIN_REFILL_CHUNKS {
        n = MIN_REFILL_CHUNKS;
    }
    n
}

/// Whether a thread cache holding `segments` segments of `class_bytes` chunks
/// is over the offload threshold.
#[inline]
pub fn should_offload(segments: usize, class_bytes: usize) -> bool {
    segments >= 2
        && segments
            .saturating_mul(SEGMENT_CAPACITY)
            .saturating_mul(class_bytes)
            >= OFFLOAD_THRESHOLD_BYTES
}

/// Number of middle segments to export once [`should_offload`] fires.
#[inline]
pub fn offload_count(segments: usize) -> usize {
    segments / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "no-batch"))]
    #[test]
    fn test_region_batch_len_clamps() {
        assert_eq!(region_batch_len(PAGE_SIZE), REGION_BATCH_MIN);
        assert_eq!(region_batch_len(1024 * 1024), 16 * 1024 * 1024);
        assert_eq!(region_batch_len(8 * 1024 * 1024), REGION_BATCH_MAX);
        assert_eq!(region_batch_len(100 * 1024 * 1024), 100 * 1024 * 1024);
    }

    #[cfg(feature = "no-batch")]
    #[test]
    fn test_region_batch_len_exact() {
        assert_eq!(region_batch_len(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(region_batch_len(3 * PAGE_SIZE), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_region_batch_len_page_rounded() {
        for len in [1, 4095, 4097, 3 * 1024 * 1024 + 7, 200 * 1024 * 1024 + 1] {
            let batch = region_batch_len(len);
            assert_eq!(batch % PAGE_SIZE, 0, "len {len}");
            assert!(batch >= len);
        }
    }

    #[test]
    fn test_refill_count_small_class() {
        let mut n = next_refill_count(0, 8);
        assert_eq!(n, MIN_REFILL_CHUNKS);
        for _ in 0..40 {
            n = next_refill_count(n, 8);
        }
        assert_eq!(n, MAX_REFILL_BYTES / 8);
    }

    #[test]
    fn test_refill_count_doubles() {
        assert_eq!(next_refill_count(32, 64), 64);
        assert_eq!(next_refill_count(64, 64), 128);
    }

    #[test]
    fn test_refill_count_floor_wins_over_cap() {
        // 32 * 256 KiB is over the cap, the floor still applies.
        assert_eq!(next_refill_count(0, 256 * 1024), MIN_REFILL_CHUNKS);
        assert_eq!(next_refill_count(32, 256 * 1024), MIN_REFILL_CHUNKS);
    }

    #[test]
    fn test_refill_count_large_class() {
        assert_eq!(next_refill_count(0, 512 * 1024), 1);
        assert_eq!(next_refill_count(1, 512 * 1024), 2);
        assert_eq!(next_refill_count(2, 512 * 1024), 2);
        assert_eq!(next_refill_count(0, 8 * 1024 * 1024), 1);
        assert_eq!(next_refill_count(1, 8 * 1024 * 1024), 1);
        assert_eq!(next_refill_count(usize::MAX, usize::MAX), 1);
    }

    #[test]
    fn test_should_offload() {
        assert!(!should_offload(1, usize::MAX));
        assert!(!should_offload(2, 8));
        assert!(should_offload(2, 64 * 1024));
        let per_segment = SEGMENT_CAPACITY * 8192;
        let needed = OFFLOAD_THRESHOLD_BYTES.div_ceil(per_segment);
        assert!(!should_offload(needed - 1, 8192));
        assert!(should_offload(needed, 8192));
    }

    #[test]
    fn test_offload_count_is_half() {
        assert_eq!(offload_count(2), 1);
        assert_eq!(offload_count(3), 1);
        assert_eq!(offload_count(10), 5);
    }
}
