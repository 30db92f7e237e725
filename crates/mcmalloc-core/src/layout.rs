//! Memory geometry shared by the policy and runtime crates.

use std::mem::size_of;

/// Page size assumed for every OS mapping.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of the in-band header that precedes every payload: usable size,
/// class index plus signature, alignment offset, and the offset slot that
/// sits directly before an unpadded payload.
pub const CHUNK_HEADER_SIZE: usize = 4 * size_of::<usize>();

/// Every chunk unit (header + payload) is a multiple of this.
pub const CHUNK_UNIT_ALIGN: usize = 16;

/// Requested alignments at or below this are already met by the layout.
pub const NATURAL_ALIGN: usize = size_of::<usize>();

/// Pages per segment.
pub const SEGMENT_PAGES: usize = 2;

/// Bytes per segment.
pub const SEGMENT_BYTES: usize = PAGE_SIZE * SEGMENT_PAGES;

/// Chunk slots per segment: whatever is left of the pages after the two links.
pub const SEGMENT_CAPACITY: usize =
    (SEGMENT_BYTES - 2 * size_of::<usize>()) / size_of::<usize>();

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Overflow-checked [`align_up`].
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Size of one header + payload unit for a class of `size` usable bytes.
#[inline]
pub const fn unit_size(size: usize) -> Option<usize> {
    match CHUNK_HEADER_SIZE.checked_add(size) {
        Some(v) => checked_align_up(v, CHUNK_UNIT_ALIGN),
        None => None,
    }
}

/// Padding that moves `addr` up to the next multiple of `alignment`.
///
/// Alignments of a word or less need no padding.
#[inline]
pub const fn alignment_padding(addr: usize, alignment: usize) -> usize {
    if alignment <= NATURAL_ALIGN {
        return 0;
    }
    let rem = addr % alignment;
    if rem == 0 { 0 } else { alignment - rem }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_fills_pages_exactly() {
        assert_eq!(
            SEGMENT_CAPACITY * size_of::<usize>() + 2 * size_of::<usize>(),
            SEGMENT_BYTES
        );
        #[cfg(target_pointer_width = "64")]
        assert_eq!(SEGMENT_CAPACITY, 1022);
    }

    #[test]
    fn test_unit_size() {
        assert_eq!(unit_size(8), Some(48));
        assert_eq!(unit_size(16), Some(48));
        assert_eq!(unit_size(17), Some(64));
        assert_eq!(unit_size(4096), Some(4096 + CHUNK_HEADER_SIZE));
        assert_eq!(unit_size(usize::MAX), None);
        for size in 1..300 {
            let unit = unit_size(size).unwrap();
            assert_eq!(unit % CHUNK_UNIT_ALIGN, 0);
            assert!(unit >= CHUNK_HEADER_SIZE + size);
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(checked_align_up(usize::MAX - 3, 16), None);
    }

    #[test]
    fn test_alignment_padding() {
        assert_eq!(alignment_padding(0x1010, 8), 0);
        assert_eq!(alignment_padding(0x1010, 16), 0);
        assert_eq!(alignment_padding(0x1010, 64), 0x30);
        assert_eq!(alignment_padding(0x1040, 64), 0);
        assert_eq!(alignment_padding(0x1020, 4096), 0xFE0);
        for addr in (0x1000..0x1400).step_by(16) {
            for alignment in [16, 32, 64, 128, 256] {
                let pad = alignment_padding(addr, alignment);
                assert_eq!((addr + pad) % alignment, 0);
                assert!(pad < alignment);
            }
        }
    }
}
