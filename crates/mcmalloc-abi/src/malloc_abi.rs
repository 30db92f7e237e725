//! ABI layer for the allocation entry points.
//!
//! Every symbol resolves the process-wide engine and the calling thread's
//! cache-matrix index, then forwards to the engine's raw-pointer surface.
//! Recoverable failures (oversize requests, bad alignment) come back as null
//! or an error code with `errno` set; anything else aborts the process.
//!
//! A call that arrives while the same thread is already inside the allocator
//! never touches the thread's cache: allocations are served from a dedicated
//! mapping and frees are dropped.

use std::ffi::{c_int, c_void};
use std::ptr;

use mcmalloc_core::layout::PAGE_SIZE;
use mcmalloc_membrane::{Engine, MallocError};

use crate::engine_state::{
    enter_allocator_reentry_guard, global_engine, recoverable_errno, thread_index,
};

/// Run `op` on this thread's row, or `nested` when the allocator is already
/// active on this thread. Recoverable errors set errno and yield `failed`.
#[inline]
fn dispatch<T>(
    failed: T,
    nested: impl FnOnce(&'static Engine) -> Result<T, MallocError>,
    op: impl FnOnce(&'static Engine, usize) -> Result<T, MallocError>,
) -> T {
    let engine = global_engine();
    let result = match enter_allocator_reentry_guard() {
        Some(_guard) => thread_index(engine).and_then(|index| op(engine, index)),
        None => nested(engine),
    };
    result.unwrap_or_else(|err| {
        recoverable_errno(&err);
        failed
    })
}

#[inline]
fn detached(engine: &Engine, size: usize) -> Result<*mut c_void, MallocError> {
    if size == 0 {
        return Ok(ptr::null_mut());
    }
    Ok(engine.allocate_detached(size)?.cast())
}

#[inline]
fn detached_aligned(
    engine: &Engine,
    alignment: usize,
    size: usize,
) -> Result<*mut c_void, MallocError> {
    if size == 0 {
        return Ok(ptr::null_mut());
    }
    Ok(engine.allocate_detached_aligned(alignment, size)?.cast())
}

/// `posix_memalign` also demands a multiple of the pointer size.
#[inline]
fn check_posix_alignment(alignment: usize) -> Result<(), MallocError> {
    if alignment.is_power_of_two() && alignment % size_of::<*mut c_void>() == 0 {
        Ok(())
    } else {
        Err(MallocError::InvalidAlignment { alignment })
    }
}

// ---------------------------------------------------------------------------
// malloc / free / calloc / realloc
// ---------------------------------------------------------------------------

/// POSIX `malloc`. Zero bytes yield null without touching errno.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    dispatch(
        ptr::null_mut(),
        |engine| detached(engine, size),
        // SAFETY: `index` belongs to this thread.
        |engine, index| Ok(unsafe { engine.malloc(index, size)? }.cast()),
    )
}

/// POSIX `free`. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    dispatch(
        (),
        |_| Ok(()),
        // SAFETY: `index` belongs to this thread; `ptr` is the caller's.
        |engine, index| unsafe { engine.free(index, ptr.cast()) },
    )
}

/// POSIX `calloc`. A zero count or size yields null; an overflowing product
/// yields null with `ENOMEM`.
///
/// # Safety
///
/// As for [`malloc`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    dispatch(
        ptr::null_mut(),
        |engine| {
            if nmemb == 0 || size == 0 {
                return Ok(ptr::null_mut());
            }
            let total = nmemb
                .checked_mul(size)
                .ok_or(MallocError::RequestTooLarge { size: usize::MAX })?;
            // Fresh mappings are already zeroed.
            detached(engine, total)
        },
        // SAFETY: `index` belongs to this thread.
        |engine, index| Ok(unsafe { engine.calloc(index, nmemb, size)? }.cast()),
    )
}

/// POSIX `realloc`. Null behaves as `malloc`, zero bytes as `free`. Shrinking
/// never moves the block.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    dispatch(
        ptr::null_mut(),
        |engine| {
            if ptr.is_null() {
                return detached(engine, size);
            }
            // SAFETY: `ptr` is a live block of this allocator.
            let usable = unsafe { engine.usable_size(ptr.cast()) };
            if size == 0 || size <= usable {
                return Ok(if size == 0 { ptr::null_mut() } else { ptr });
            }
            let fresh = detached(engine, size)?;
            // SAFETY: distinct blocks; `fresh` holds more than `usable` bytes.
            unsafe { ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), usable) };
            Ok(fresh)
        },
        // SAFETY: `index` belongs to this thread; `ptr` is the caller's.
        |engine, index| Ok(unsafe { engine.realloc(index, ptr.cast(), size)? }.cast()),
    )
}

// ---------------------------------------------------------------------------
// aligned allocation
// ---------------------------------------------------------------------------

/// POSIX `posix_memalign`. Returns 0 or `EINVAL`/`ENOMEM`; `*memptr` is
/// written only on success, with null for zero bytes.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    let engine = global_engine();
    // A bad alignment is EINVAL even for size 0.
    let result = check_posix_alignment(alignment).and_then(|()| {
        match enter_allocator_reentry_guard() {
            Some(_guard) => {
                let index = thread_index(engine)?;
                // SAFETY: `index` belongs to this thread; `memptr` is writable.
                unsafe { engine.posix_memalign(index, memptr.cast(), alignment, size) }
            }
            None => {
                let p = detached_aligned(engine, alignment, size)?;
                // SAFETY: caller guarantees `memptr` is writable.
                unsafe { memptr.write(p) };
                Ok(())
            }
        }
    });
    match result {
        Ok(()) => 0,
        // posix_memalign reports through its return value, not errno.
        Err(err) => match err.errno() {
            Some(code) => code,
            None => mcmalloc_membrane::fatal(&err),
        },
    }
}

/// Legacy `memalign`.
///
/// # Safety
///
/// As for [`malloc`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    dispatch(
        ptr::null_mut(),
        |engine| detached_aligned(engine, alignment, size),
        // SAFETY: `index` belongs to this thread.
        |engine, index| Ok(unsafe { engine.memalign(index, alignment, size)? }.cast()),
    )
}

/// C11 `aligned_alloc`.
///
/// # Safety
///
/// As for [`malloc`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: forwarded contract.
    unsafe { memalign(alignment, size) }
}

/// Legacy `valloc`: page-aligned.
///
/// # Safety
///
/// As for [`malloc`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded contract.
    unsafe { memalign(PAGE_SIZE, size) }
}

/// GNU `malloc_usable_size`: the chunk's class size less its alignment offset.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    // SAFETY: forwarded contract.
    unsafe { global_engine().usable_size(ptr.cast()) }
}
