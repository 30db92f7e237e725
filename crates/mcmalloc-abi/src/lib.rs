// Every extern "C" export takes raw pointers from C callers; the contract is
// the C one, stated once per module.
#![allow(clippy::missing_safety_doc)]
//! # mcmalloc-abi
//!
//! C allocator ABI for mcmalloc.
//!
//! This crate produces a `cdylib` that exports `malloc`, `free`, `calloc`,
//! `realloc`, `posix_memalign`, `aligned_alloc`, `memalign`, `valloc` and
//! `malloc_usable_size`, plus the `mcmalloc_*` lifecycle hooks. Preloading it
//! replaces the host allocator.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> thread index -> Engine (membrane) -> return
//! ```
//!
//! Symbols are exported unmangled only in release builds, so debug and test
//! binaries keep the system allocator and can call these functions as plain
//! Rust.

pub mod engine_state;
pub mod lifecycle_abi;

// Gated behind cfg(not(test)) so a release-mode unit test binary does not
// route its own allocations through the engine under test.
#[cfg(not(test))]
pub mod malloc_abi;
