//! Process-wide engine and per-thread allocator state.
//!
//! The engine lives in a static slot rather than a `Box` or `OnceLock`: it is
//! built by the first `malloc` of the process, before there is a heap to box
//! it in, and `OnceLock` would wait on itself if that first call re-entered.
//! Every thread keeps its cache-matrix index and an allocator reentry depth in
//! const thread-locals, which need no destructor registration.

use std::cell::{Cell, UnsafeCell};
use std::ffi::c_int;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};

use mcmalloc_membrane::{Engine, MallocError, env, fatal};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

const UNASSIGNED: usize = usize::MAX;

struct EngineSlot(UnsafeCell<MaybeUninit<Engine>>);

// SAFETY: written once by the thread that wins UNINIT -> INITIALIZING, and
// only read after READY is published with release ordering.
unsafe impl Sync for EngineSlot {}

static ENGINE_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static ENGINE: EngineSlot = EngineSlot(UnsafeCell::new(MaybeUninit::uninit()));

thread_local! {
    static THREAD_INDEX: Cell<usize> = const { Cell::new(UNASSIGNED) };
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The engine, if some thread has finished building it.
pub fn try_global_engine() -> Option<&'static Engine> {
    if ENGINE_STATE.load(Ordering::Acquire) == STATE_READY {
        // SAFETY: READY is stored only after the slot was written.
        Some(unsafe { (*ENGINE.0.get()).assume_init_ref() })
    } else {
        None
    }
}

/// The engine, building it from the environment on first use.
///
/// Threads that lose the race yield until the winner publishes. Building
/// never allocates, so the winner cannot re-enter here.
pub fn global_engine() -> &'static Engine {
    loop {
        if let Some(engine) = try_global_engine() {
            return engine;
        }
        if ENGINE_STATE
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let engine = match Engine::new(env::config_from_env()) {
                Ok(engine) => engine,
                Err(err) => fatal(&err),
            };
            // SAFETY: this thread won the transition out of UNINIT, so it is
            // the only writer and no reader runs before READY.
            unsafe { (*ENGINE.0.get()).write(engine) };
            ENGINE_STATE.store(STATE_READY, Ordering::Release);
        } else {
            std::thread::yield_now();
        }
    }
}

/// This thread's cache-matrix index, if it holds one.
pub fn current_index() -> Option<usize> {
    let index = THREAD_INDEX.with(Cell::get);
    (index != UNASSIGNED).then_some(index)
}

/// This thread's index, claiming a worker index on first use.
pub fn thread_index(engine: &Engine) -> Result<usize, MallocError> {
    if let Some(index) = current_index() {
        return Ok(index);
    }
    let index = engine.claim_index()?;
    THREAD_INDEX.with(|cell| cell.set(index));
    Ok(index)
}

/// Make the reserved main index this thread's index.
///
/// A worker index claimed by an earlier allocation is handed back first; its
/// cached chunks stay with the row.
pub fn adopt_main_index(engine: &Engine) -> Result<usize, MallocError> {
    if let Some(old) = current_index() {
        if old == mcmalloc_membrane::registry::MAIN_THREAD_INDEX {
            return Ok(old);
        }
        THREAD_INDEX.with(|cell| cell.set(UNASSIGNED));
        // SAFETY: this thread held `old` and no longer refers to it.
        unsafe { engine.detach(old)? };
    }
    let index = engine.claim_main_index()?;
    THREAD_INDEX.with(|cell| cell.set(index));
    Ok(index)
}

/// Return this thread's index, if any. Idempotent.
pub fn release_thread_index(engine: &Engine) -> Result<(), MallocError> {
    let Some(index) = current_index() else {
        return Ok(());
    };
    THREAD_INDEX.with(|cell| cell.set(UNASSIGNED));
    // SAFETY: this thread held `index` and no longer refers to it.
    unsafe { engine.detach(index) }
}

pub struct AllocatorReentryGuard;

impl Drop for AllocatorReentryGuard {
    fn drop(&mut self) {
        ALLOCATOR_REENTRY_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

/// Mark an allocator call in progress. `None` when one already is.
#[inline]
pub fn enter_allocator_reentry_guard() -> Option<AllocatorReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH.with(|depth| {
        let current = depth.get();
        if current > 0 {
            None
        } else {
            depth.set(current + 1);
            Some(AllocatorReentryGuard)
        }
    })
}

#[inline]
pub fn set_errno(val: c_int) {
    // SAFETY: __errno_location returns a valid pointer to this thread's errno.
    unsafe { *libc::__errno_location() = val };
}

/// Report a recoverable error through errno and return its code. Anything
/// else terminates the process.
#[inline]
pub fn recoverable_errno(err: &MallocError) -> c_int {
    match err.errno() {
        Some(code) => {
            set_errno(code);
            code
        }
        None => fatal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentry_guard_nests_once() {
        let outer = enter_allocator_reentry_guard();
        assert!(outer.is_some());
        assert!(enter_allocator_reentry_guard().is_none());
        drop(outer);
        assert!(enter_allocator_reentry_guard().is_some());
    }

    #[test]
    fn test_global_engine_is_shared() {
        let a = global_engine() as *const Engine;
        let b = std::thread::spawn(|| global_engine() as *const Engine as usize)
            .join()
            .unwrap();
        assert_eq!(a as usize, b);
        assert!(try_global_engine().is_some());
    }

    #[test]
    fn test_thread_index_claimed_lazily_and_released() {
        std::thread::spawn(|| {
            let engine = global_engine();
            assert_eq!(current_index(), None);
            let index = thread_index(engine).unwrap();
            assert_ne!(index, mcmalloc_membrane::registry::MAIN_THREAD_INDEX);
            assert_eq!(thread_index(engine).unwrap(), index);
            release_thread_index(engine).unwrap();
            assert_eq!(current_index(), None);
            release_thread_index(engine).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_recoverable_errno_sets_errno() {
        let code = recoverable_errno(&MallocError::InvalidAlignment { alignment: 3 });
        assert_eq!(code, libc::EINVAL);
        // SAFETY: reading this thread's errno.
        assert_eq!(unsafe { *libc::__errno_location() }, libc::EINVAL);
    }
}
