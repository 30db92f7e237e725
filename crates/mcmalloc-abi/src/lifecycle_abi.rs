//! Process and thread lifecycle hooks, and the statistics reporter switch.
//!
//! The host calls `mcmalloc_main_init` once on the main thread before it
//! allocates in earnest, and `mcmalloc_thread_init`/`mcmalloc_thread_term`
//! around every worker thread. A thread that allocates without calling
//! `mcmalloc_thread_init` still gets an index on first use, but only
//! `mcmalloc_thread_term` gives it back.
//!
//! Hooks return 0 on success and -1 with `errno` set on failure.

use std::ffi::{CStr, OsStr, c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;

use mcmalloc_membrane::{
    CallStatsSnapshot, Engine, LifecycleEvent, LogLevel, MallocError, StatsReporter, StatsSource,
    env, fatal,
};

use crate::engine_state::{
    adopt_main_index, enter_allocator_reentry_guard, global_engine, release_thread_index,
    set_errno, thread_index,
};

static REPORTER: Mutex<Option<StatsReporter>> = Mutex::new(None);

/// Reporter source that also hands back the reporter thread's own index.
struct EngineStats(&'static Engine);

impl StatsSource for EngineStats {
    fn snapshot(&self) -> CallStatsSnapshot {
        self.0.stats()
    }

    fn on_exit(&self) {
        if let Err(err) = release_thread_index(self.0) {
            fatal(&err);
        }
    }
}

#[inline]
fn hook_result(result: Result<(), MallocError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            // Slot exhaustion and a second main claim are reported, not fatal.
            let code = match &err {
                MallocError::ThreadSlotsExhausted { .. } => libc::EAGAIN,
                MallocError::MainSlotClaimed => libc::EBUSY,
                other => other.errno().unwrap_or_else(|| fatal(other)),
            };
            set_errno(code);
            -1
        }
    }
}

fn start_reporter(engine: &'static Engine, dir: &Path) -> c_int {
    let mut slot = REPORTER.lock();
    if slot.is_some() {
        set_errno(libc::EBUSY);
        return -1;
    }
    let interval = Duration::from_millis(engine.config().stats_interval_ms.max(1));
    match StatsReporter::start(dir, interval, EngineStats(engine)) {
        Ok(reporter) => {
            *slot = Some(reporter);
            engine.record_event(
                LifecycleEvent::new(LogLevel::Info, "mcmalloc_log_thread_start", "reporter_start")
                    .outcome("ok")
                    .detail(interval.as_millis() as u64),
            );
            0
        }
        Err(err) => {
            engine.record_event(
                LifecycleEvent::new(LogLevel::Warn, "mcmalloc_log_thread_start", "reporter_start")
                    .outcome("io_error"),
            );
            set_errno(err.raw_os_error().unwrap_or(libc::EIO));
            -1
        }
    }
}

/// Main-thread startup: build the engine, take the reserved main index, and
/// start the reporter when `MCMALLOC_STATS_DIR` is set.
///
/// # Safety
///
/// Call once, from the main thread.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcmalloc_main_init() -> c_int {
    let engine = global_engine();
    let claimed = {
        let _guard = enter_allocator_reentry_guard();
        adopt_main_index(engine).map(drop)
    };
    let rc = hook_result(claimed);
    if rc != 0 {
        return rc;
    }
    match env::stats_dir() {
        Some(dir) => start_reporter(engine, Path::new(dir)),
        None => 0,
    }
}

/// Worker-thread startup: claim this thread's index now rather than on its
/// first allocation.
///
/// # Safety
///
/// Call from the thread being started.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcmalloc_thread_init() -> c_int {
    let engine = global_engine();
    let _guard = enter_allocator_reentry_guard();
    hook_result(thread_index(engine).map(drop))
}

/// Thread teardown: unmap the thread's unused reservation and return its
/// index. Safe to call on a thread that never allocated.
///
/// # Safety
///
/// Call from the exiting thread, after its last allocator call.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcmalloc_thread_term() {
    let Some(engine) = crate::engine_state::try_global_engine() else {
        return;
    };
    let _guard = enter_allocator_reentry_guard();
    if let Err(err) = release_thread_index(engine) {
        fatal(&err);
    }
}

/// Start the statistics reporter writing into `dir`.
///
/// # Safety
///
/// `dir` must be null or a NUL-terminated string.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcmalloc_log_thread_start(dir: *const c_char) -> c_int {
    if dir.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let bytes = unsafe { CStr::from_ptr(dir) }.to_bytes();
    if bytes.is_empty() {
        set_errno(libc::EINVAL);
        return -1;
    }
    start_reporter(global_engine(), Path::new(OsStr::from_bytes(bytes)))
}

/// Stop the reporter after a final sample. A no-op when none is running.
///
/// # Safety
///
/// Must not be called from the reporter thread.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mcmalloc_log_thread_join() -> c_int {
    let Some(reporter) = REPORTER.lock().take() else {
        return 0;
    };
    let engine = global_engine();
    match reporter.join() {
        Ok(samples) => {
            engine.record_event(
                LifecycleEvent::new(LogLevel::Info, "mcmalloc_log_thread_join", "reporter_stop")
                    .outcome("ok")
                    .detail(samples),
            );
            0
        }
        Err(err) => {
            engine.record_event(
                LifecycleEvent::new(LogLevel::Warn, "mcmalloc_log_thread_join", "reporter_stop")
                    .outcome("io_error"),
            );
            set_errno(err.raw_os_error().unwrap_or(libc::EIO));
            -1
        }
    }
}
