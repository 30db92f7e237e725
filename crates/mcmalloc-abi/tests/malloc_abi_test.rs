//! Integration tests for the allocation symbols, called as plain Rust.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::thread;

use mcmalloc_abi::engine_state::{current_index, enter_allocator_reentry_guard, global_engine};
use mcmalloc_abi::lifecycle_abi::{mcmalloc_thread_init, mcmalloc_thread_term};
use mcmalloc_abi::malloc_abi::{
    aligned_alloc, calloc, free, malloc, malloc_usable_size, memalign, posix_memalign, realloc,
    valloc,
};
use mcmalloc_core::layout::PAGE_SIZE;
use mcmalloc_core::size_class::MAX_REQUEST_SIZE;

fn errno() -> c_int {
    // SAFETY: reading this thread's errno.
    unsafe { *libc::__errno_location() }
}

fn clear_errno() {
    // SAFETY: writing this thread's errno.
    unsafe { *libc::__errno_location() = 0 };
}

/// Run `f` on a fresh thread that gives its index back afterwards.
fn on_thread(f: impl FnOnce() + Send + 'static) {
    thread::spawn(move || {
        f();
        // SAFETY: the thread makes no allocator calls after this.
        unsafe { mcmalloc_thread_term() };
    })
    .join()
    .unwrap();
}

#[test]
fn malloc_zero_is_null_without_errno() {
    on_thread(|| unsafe {
        clear_errno();
        assert!(malloc(0).is_null());
        assert_eq!(errno(), 0);
        free(ptr::null_mut());
    });
}

#[test]
fn malloc_round_trip() {
    on_thread(|| unsafe {
        let p = malloc(100).cast::<u8>();
        assert!(!p.is_null());
        assert!(malloc_usable_size(p.cast()) >= 100);
        p.write_bytes(0x5A, 100);
        assert!(std::slice::from_raw_parts(p, 100).iter().all(|&b| b == 0x5A));
        free(p.cast());
        assert!(current_index().is_some(), "first malloc claims an index");
    });
}

#[test]
fn oversize_request_sets_enomem() {
    on_thread(|| unsafe {
        clear_errno();
        assert!(malloc(MAX_REQUEST_SIZE + 1).is_null());
        assert_eq!(errno(), libc::ENOMEM);
    });
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    on_thread(|| unsafe {
        // Dirty a block first so the recycled chunk is not trivially zero.
        let dirty = malloc(256).cast::<u8>();
        dirty.write_bytes(0xFF, 256);
        free(dirty.cast());

        let p = calloc(16, 16).cast::<u8>();
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 256).iter().all(|&b| b == 0));
        free(p.cast());

        assert!(calloc(0, 16).is_null());
        assert!(calloc(16, 0).is_null());
        clear_errno();
        assert!(calloc(usize::MAX / 2, 4).is_null());
        assert_eq!(errno(), libc::ENOMEM);
    });
}

#[test]
fn realloc_contract() {
    on_thread(|| unsafe {
        let p = realloc(ptr::null_mut(), 300);
        assert!(!p.is_null());
        let usable = malloc_usable_size(p);
        assert_eq!(realloc(p, usable), p);
        assert_eq!(realloc(p, usable - 1), p);

        p.cast::<u8>().write_bytes(0x11, usable);
        let q = realloc(p, usable * 4);
        assert!(malloc_usable_size(q) >= usable * 4);
        assert!(std::slice::from_raw_parts(q.cast::<u8>(), usable)
            .iter()
            .all(|&b| b == 0x11));
        assert!(realloc(q, 0).is_null());
    });
}

#[test]
fn posix_memalign_contract() {
    on_thread(|| unsafe {
        let mut out: *mut c_void = ptr::null_mut();
        assert_eq!(posix_memalign(&mut out, 3, 10), libc::EINVAL);
        assert_eq!(posix_memalign(&mut out, 4, 10), libc::EINVAL);
        assert!(out.is_null(), "untouched on failure");

        assert_eq!(posix_memalign(&mut out, 64, 100), 0);
        assert_eq!(out as usize % 64, 0);
        assert!(malloc_usable_size(out) >= 100);
        free(out);

        out = 1 as *mut c_void;
        assert_eq!(posix_memalign(&mut out, 64, 0), 0);
        assert!(out.is_null());
        assert_eq!(posix_memalign(ptr::null_mut(), 64, 8), libc::EINVAL);

        out = 1 as *mut c_void;
        assert_eq!(posix_memalign(&mut out, 3, 0), libc::EINVAL);
        assert_eq!(posix_memalign(&mut out, 4, 0), libc::EINVAL);
        assert_eq!(out as usize, 1, "size 0 does not bypass the alignment check");
    });
}

#[test]
fn aligned_variants() {
    on_thread(|| unsafe {
        for align in [16usize, 64, 256, 1024] {
            let p = memalign(align, 40);
            assert_eq!(p as usize % align, 0);
            free(p);
            let q = aligned_alloc(align, align * 2);
            assert_eq!(q as usize % align, 0);
            free(q);
        }
        let v = valloc(10);
        assert_eq!(v as usize % PAGE_SIZE, 0);
        free(v);

        clear_errno();
        assert!(memalign(48, 16).is_null());
        assert_eq!(errno(), libc::EINVAL);
    });
}

#[test]
fn nested_calls_use_detached_chunks() {
    on_thread(|| unsafe {
        let engine = global_engine();
        let before = engine.metrics().detached_chunks;
        let (p, a) = {
            let _outer = enter_allocator_reentry_guard().unwrap();
            let p = malloc(200);
            let a = memalign(512, 8);
            // A nested free is dropped; the chunk is never cached.
            let scratch = malloc(16);
            free(scratch);
            (p, a)
        };
        assert!(engine.metrics().detached_chunks >= before + 3);
        assert_eq!(a as usize % 512, 0);
        assert!(malloc_usable_size(p) >= 200);
        free(p);
        free(a);
    });
}

#[test]
fn explicit_thread_hooks() {
    on_thread(|| unsafe {
        // Thread startup may already have allocated in a preloaded build.
        mcmalloc_thread_term();
        assert_eq!(current_index(), None);
        assert_eq!(mcmalloc_thread_init(), 0);
        let index = current_index().unwrap();
        let p = malloc(64);
        free(p);
        assert_eq!(current_index(), Some(index));
        mcmalloc_thread_term();
        assert_eq!(current_index(), None);
    });
}

#[test]
fn frees_may_cross_threads() {
    let addrs: Vec<usize> = thread::spawn(|| {
        let out = (0..64).map(|i| unsafe { malloc(32 + i) as usize }).collect();
        // SAFETY: no allocator calls follow on this thread.
        unsafe { mcmalloc_thread_term() };
        out
    })
    .join()
    .unwrap();
    on_thread(move || unsafe {
        for p in addrs {
            free(p as *mut c_void);
        }
    });
}

#[test]
fn concurrent_churn() {
    let handles: Vec<_> = (0..8u8)
        .map(|t| {
            thread::spawn(move || unsafe {
                let mut held = Vec::with_capacity(128);
                for i in 0..5_000usize {
                    let size = 1 + (i * 131 + t as usize * 7) % 4096;
                    let p = malloc(size).cast::<u8>();
                    *p = t;
                    held.push(p);
                    if held.len() == 128 {
                        for p in held.drain(..) {
                            assert_eq!(*p, t);
                            free(p.cast());
                        }
                    }
                }
                for p in held {
                    free(p.cast());
                }
                mcmalloc_thread_term();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
