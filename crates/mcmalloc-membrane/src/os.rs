//! Anonymous private mappings, the only source of memory the engine uses.

use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr::{self, NonNull};

use mcmalloc_core::MallocError;
use mcmalloc_core::layout::{PAGE_SIZE, checked_align_up};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map `len` bytes of zeroed, page-aligned read/write memory.
///
/// Pages are reserved lazily (`MAP_NORESERVE`), so large batches cost
/// nothing until touched.
pub fn map(len: usize) -> Result<NonNull<u8>, MallocError> {
    if len == 0 {
        return Err(MallocError::EmptyRegionRequest);
    }
    // SAFETY: anonymous private mapping with no address hint; the kernel
    // picks a fresh range and nothing else aliases it.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(MallocError::MapFailed {
            len,
            errno: last_errno(),
        });
    }
    NonNull::new(raw.cast::<u8>()).ok_or(MallocError::MapFailed { len, errno: 0 })
}

/// Return `len` bytes at `ptr` to the OS.
///
/// # Safety
///
/// `ptr..ptr + len` must lie inside a mapping made by [`map`] and nothing may
/// reference it afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), MallocError> {
    // SAFETY: caller guarantees the range is ours and unused.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    if rc != 0 {
        return Err(MallocError::UnmapFailed {
            addr: ptr.as_ptr() as usize,
            len,
            errno: last_errno(),
        });
    }
    Ok(())
}

/// Fixed-length array living in its own mapping.
///
/// The engine cannot use the heap for its own tables when it *is* the heap,
/// so the cache matrix, statistics rows, shards and learn table live here.
pub struct MappedArray<T> {
    ptr: NonNull<T>,
    len: usize,
    bytes: usize,
}

// SAFETY: MappedArray owns its elements exclusively, like Box<[T]>.
unsafe impl<T: Send> Send for MappedArray<T> {}
// SAFETY: shared access only hands out &T.
unsafe impl<T: Sync> Sync for MappedArray<T> {}

impl<T> MappedArray<T> {
    /// Map room for `len` elements and initialize each with `init(index)`.
    pub fn new(len: usize, mut init: impl FnMut(usize) -> T) -> Result<Self, MallocError> {
        let array = Self::map_uninit(len)?;
        for i in 0..len {
            // SAFETY: `i < len`, the slot is inside the mapping and unaliased.
            unsafe { array.ptr.as_ptr().add(i).write(init(i)) };
        }
        Ok(array)
    }

    /// Map room for `len` elements left as the zero bytes the OS provides.
    ///
    /// # Safety
    ///
    /// The all-zero bit pattern must be a valid `T`.
    pub unsafe fn zeroed(len: usize) -> Result<Self, MallocError> {
        Self::map_uninit(len)
    }

    fn map_uninit(len: usize) -> Result<Self, MallocError> {
        const { assert!(align_of::<T>() <= PAGE_SIZE) };
        let bytes = len
            .checked_mul(size_of::<T>())
            .and_then(|b| checked_align_up(b, PAGE_SIZE))
            .ok_or(MallocError::MapFailed {
                len: usize::MAX,
                errno: 0,
            })?;
        if bytes == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
                bytes: 0,
            });
        }
        let ptr = map(bytes)?.cast::<T>();
        Ok(Self { ptr, len, bytes })
    }
}

impl<T> Deref for MappedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: every element was initialized at construction.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for MappedArray<T> {
    fn drop(&mut self) {
        // SAFETY: the elements are initialized and dropped exactly once here.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
        }
        if self.bytes == 0 {
            return;
        }
        // SAFETY: this is the mapping made in `map_uninit`, now unreferenced.
        if let Err(err) = unsafe { unmap(self.ptr.cast(), self.bytes) } {
            crate::fatal::fatal(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_map_is_page_aligned_and_zeroed() {
        let p = map(3 * PAGE_SIZE).expect("map should succeed");
        assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
        // SAFETY: freshly mapped, three pages long.
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 3 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: mapping is ours and unreferenced after this.
        unsafe { unmap(p, 3 * PAGE_SIZE) }.expect("unmap should succeed");
    }

    #[test]
    fn test_map_zero_is_rejected() {
        assert_eq!(map(0), Err(MallocError::EmptyRegionRequest));
    }

    #[test]
    fn test_mapped_array_init_and_drop() {
        let array = MappedArray::new(1000, |i| i * 3).expect("map should succeed");
        assert_eq!(array.len(), 1000);
        assert_eq!(array[999], 2997);
        assert_eq!(array.iter().sum::<usize>(), 3 * 999 * 1000 / 2);
    }

    #[test]
    fn test_mapped_array_zeroed_atomics() {
        // SAFETY: zero is a valid AtomicU32.
        let array = unsafe { MappedArray::<AtomicU32>::zeroed(5000) }.expect("map should succeed");
        array[4999].fetch_add(7, Ordering::Relaxed);
        assert_eq!(array[0].load(Ordering::Relaxed), 0);
        assert_eq!(array[4999].load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_mapped_array_empty() {
        let array = MappedArray::<u64>::new(0, |_| 1).expect("empty array");
        assert!(array.is_empty());
    }
}
