//! In-band chunk header.
//!
//! ```text
//!  header (32 bytes)                          payload
//! +------+-------------+--------+-------------+-----------------------------+
//! | size | class | sig | offset | offset slot | .. pad .. | offset | data ->
//! +------+-------------+--------+-------------+-----------------------------+
//!                                             ^ unaligned data pointer
//!                                                                  ^ data pointer
//! ```
//!
//! The word just before the data pointer always holds the alignment offset:
//! for unpadded chunks that word is the header's own offset slot (always 0),
//! for padded chunks it is written into the padding. That makes the header
//! recoverable from the data pointer alone.

use std::mem::size_of;
use std::ptr::NonNull;

use mcmalloc_core::MallocError;
use mcmalloc_core::layout::{CHUNK_HEADER_SIZE, alignment_padding};

pub const CHUNK_SIGNATURE: u32 = 0xDEAD_C0DE;

#[repr(C)]
struct ChunkHeader {
    size: usize,
    class: u32,
    signature: u32,
    offset: usize,
    offset_slot: usize,
}

const _: () = assert!(size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

/// Handle to a constructed chunk.
///
/// Holding a `Chunk` means the header behind it is valid. Who owns the
/// payload (a cache or a caller) is tracked by whoever holds the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk(NonNull<ChunkHeader>);

// SAFETY: a chunk is plain memory owned by exactly one holder at a time.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Write a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be 16-byte aligned and point to at least
    /// `unit_size(size)` writable bytes nobody else uses.
    pub unsafe fn construct(at: NonNull<u8>, size: usize, class: usize) -> Self {
        let header = at.cast::<ChunkHeader>();
        // SAFETY: caller guarantees room and alignment.
        unsafe {
            header.write(ChunkHeader {
                size,
                class: class as u32,
                signature: CHUNK_SIGNATURE,
                offset: 0,
                offset_slot: 0,
            });
        }
        Self(header)
    }

    /// Recover the chunk behind a data pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a data pointer previously produced by [`Chunk::data_ptr`]
    /// whose chunk has not been reused since.
    pub unsafe fn from_data_ptr(ptr: NonNull<u8>) -> Self {
        // SAFETY: the word before any data pointer is the offset (see module
        // docs), and the header sits `offset + header size` below it.
        unsafe {
            let offset = ptr.cast::<usize>().sub(1).read();
            Self(ptr.sub(offset + CHUNK_HEADER_SIZE).cast::<ChunkHeader>())
        }
    }

    fn header(&self) -> &ChunkHeader {
        // SAFETY: a `Chunk` only exists over a constructed header.
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&mut self) -> &mut ChunkHeader {
        // SAFETY: as above; the handle holder owns the header.
        unsafe { self.0.as_mut() }
    }

    /// Usable bytes of the chunk's class.
    pub fn size(&self) -> usize {
        self.header().size
    }

    pub fn class(&self) -> usize {
        self.header().class as usize
    }

    pub fn offset(&self) -> usize {
        self.header().offset
    }

    /// Bytes available from the data pointer to the end of the chunk.
    pub fn usable_size(&self) -> usize {
        self.size() - self.offset()
    }

    pub fn header_addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Data pointer ignoring any alignment padding.
    pub fn unaligned_data_ptr(&self) -> NonNull<u8> {
        // SAFETY: the payload directly follows the header.
        unsafe { self.0.cast::<u8>().add(CHUNK_HEADER_SIZE) }
    }

    pub fn data_ptr(&self) -> NonNull<u8> {
        // SAFETY: `offset` never exceeds the payload.
        unsafe { self.unaligned_data_ptr().add(self.offset()) }
    }

    /// Pad the data pointer up to a multiple of `alignment`.
    ///
    /// The payload must have at least `alignment` spare bytes beyond what the
    /// caller will use; [`alignment_padding`] never exceeds `alignment - 1`.
    pub fn set_alignment(&mut self, alignment: usize) {
        let base = self.unaligned_data_ptr();
        let offset = alignment_padding(base.as_ptr() as usize, alignment);
        debug_assert!(offset <= self.size());
        self.header_mut().offset = offset;
        if offset != 0 {
            // SAFETY: the padding is at least 16 bytes (the unaligned data
            // pointer is 16-aligned), so the slot is inside the payload.
            unsafe { base.add(offset).cast::<usize>().sub(1).write(offset) };
        }
    }

    /// Drop any alignment padding so the chunk can be reused unaligned.
    pub fn clear_alignment(&mut self) {
        self.header_mut().offset = 0;
    }

    /// Check the header signature.
    pub fn verify(&self) -> Result<(), MallocError> {
        let found = self.header().signature;
        if found != CHUNK_SIGNATURE {
            return Err(MallocError::CorruptHeader {
                addr: self.header_addr(),
                found,
            });
        }
        Ok(())
    }
}
