//! Integration tests for the lifecycle hooks and the reporter switch.

use std::ffi::{CString, c_int};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use mcmalloc_abi::engine_state::{current_index, global_engine};
use mcmalloc_abi::lifecycle_abi::{
    mcmalloc_log_thread_join, mcmalloc_log_thread_start, mcmalloc_main_init, mcmalloc_thread_term,
};
use mcmalloc_abi::malloc_abi::{free, malloc};
use mcmalloc_membrane::registry::MAIN_THREAD_INDEX;
use mcmalloc_membrane::reporter::{CALL_STAT_FILE, CALL_STAT_TOTAL_FILE};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn errno() -> c_int {
    // SAFETY: reading this thread's errno.
    unsafe { *libc::__errno_location() }
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mcmalloc-abi-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[test]
fn main_init_takes_reserved_index_once() {
    let _lock = TEST_LOCK.lock().unwrap();
    thread::spawn(|| unsafe {
        // An allocation before main_init claims a worker index first.
        free(malloc(24));
        assert_ne!(current_index(), Some(MAIN_THREAD_INDEX));
        assert_eq!(mcmalloc_main_init(), 0);
        assert_eq!(current_index(), Some(MAIN_THREAD_INDEX));
        // Idempotent on the same thread.
        assert_eq!(mcmalloc_main_init(), 0);

        thread::spawn(|| {
            assert_eq!(mcmalloc_main_init(), -1);
            assert_eq!(errno(), libc::EBUSY);
            mcmalloc_thread_term();
        })
        .join()
        .unwrap();

        mcmalloc_thread_term();
        assert_eq!(current_index(), None);
    })
    .join()
    .unwrap();

    let events: Vec<_> = global_engine()
        .lifecycle_logs()
        .iter()
        .map(|r| (r.symbol, r.event))
        .collect();
    assert!(events.contains(&("main_init", "attach")));
    assert!(events.contains(&("thread_term", "detach")));
}

#[test]
fn thread_term_without_index_is_noop() {
    let _lock = TEST_LOCK.lock().unwrap();
    thread::spawn(|| unsafe {
        mcmalloc_thread_term();
        mcmalloc_thread_term();
        assert_eq!(current_index(), None);
    })
    .join()
    .unwrap();
}

#[test]
fn reporter_start_and_join() {
    let _lock = TEST_LOCK.lock().unwrap();
    let dir = temp_dir("reporter");
    let c_dir = CString::new(dir.to_str().unwrap()).unwrap();
    unsafe {
        assert_eq!(mcmalloc_log_thread_start(std::ptr::null()), -1);
        assert_eq!(errno(), libc::EINVAL);

        assert_eq!(mcmalloc_log_thread_start(c_dir.as_ptr()), 0);
        assert_eq!(mcmalloc_log_thread_start(c_dir.as_ptr()), -1);
        assert_eq!(errno(), libc::EBUSY);

        thread::spawn(|| {
            for _ in 0..100 {
                free(malloc(100));
            }
            mcmalloc_thread_term();
        })
        .join()
        .unwrap();

        assert_eq!(mcmalloc_log_thread_join(), 0);
        // Nothing left to stop.
        assert_eq!(mcmalloc_log_thread_join(), 0);
    }

    let buckets = fs::read_to_string(dir.join(CALL_STAT_FILE)).unwrap();
    assert!(buckets.starts_with("# time="));
    let totals = fs::read_to_string(dir.join(CALL_STAT_TOTAL_FILE)).unwrap();
    let last: Vec<i64> = totals
        .lines()
        .last()
        .unwrap()
        .split(' ')
        .map(|f| f.parse().unwrap())
        .collect();
    assert!(last[1] >= 100, "total malloc {}", last[1]);
    assert!(last[2] >= 100, "total free {}", last[2]);

    let events: Vec<_> = global_engine()
        .lifecycle_logs()
        .iter()
        .map(|r| r.event)
        .collect();
    assert!(events.contains(&"reporter_start"));
    assert!(events.contains(&"reporter_stop"));
    let _ = fs::remove_dir_all(&dir);
}
