//! Allocator error type and the errno values it maps to.

use thiserror::Error;

pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;

/// Everything that can go wrong inside the allocator.
///
/// Most variants are fatal once they reach the runtime: a failed mapping or a
/// corrupted header leaves nothing safe to hand back. Only
/// [`RequestTooLarge`](MallocError::RequestTooLarge) and
/// [`InvalidAlignment`](MallocError::InvalidAlignment) surface to callers, as
/// `ENOMEM` and `EINVAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MallocError {
    #[error("mmap of {len} bytes failed (errno {errno})")]
    MapFailed { len: usize, errno: i32 },
    #[error("munmap of {len} bytes at {addr:#x} failed (errno {errno})")]
    UnmapFailed { addr: usize, len: usize, errno: i32 },
    #[error("region request of zero bytes")]
    EmptyRegionRequest,
    #[error("all {capacity} thread slots are in use")]
    ThreadSlotsExhausted { capacity: usize },
    #[error("main thread slot is already claimed")]
    MainSlotClaimed,
    #[error("request of {size} bytes exceeds the largest size class")]
    RequestTooLarge { size: usize },
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },
    #[error("chunk header at {addr:#x} has signature {found:#010x}")]
    CorruptHeader { addr: usize, found: u32 },
    #[error("size class {class} still empty after a bulk refill")]
    RefillExhausted { class: usize },
    #[error("allocation owned by engine {owner} released into engine {engine}")]
    ForeignAllocation { owner: u32, engine: u32 },
    #[error("learn table holds {found} entries, expected {expected}")]
    TableSizeMismatch { expected: usize, found: usize },
}

impl MallocError {
    /// errno for the caller-visible variants, `None` for fatal ones.
    pub const fn errno(&self) -> Option<i32> {
        match self {
            Self::RequestTooLarge { .. } => Some(ENOMEM),
            Self::InvalidAlignment { .. } => Some(EINVAL),
            _ => None,
        }
    }

    /// True when the process cannot continue after this error.
    pub const fn is_fatal(&self) -> bool {
        self.errno().is_none()
    }
}
