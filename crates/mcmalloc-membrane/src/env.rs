//! Heap-free environment lookup.
//!
//! `std::env::var` allocates, which is off limits while the engine is being
//! built from inside the first `malloc`. These helpers read the environment
//! block in place with `getenv`.

use std::ffi::CStr;

use mcmalloc_core::EngineConfig;
use mcmalloc_core::config::ENV_STATS_DIR;

const MAX_NAME: usize = 64;

/// Value of `name` as it sits in the environment block.
///
/// Returns `None` for unset variables, names too long for the stack buffer,
/// and values that are not UTF-8.
pub fn getenv(name: &str) -> Option<&'static str> {
    let bytes = name.as_bytes();
    if bytes.len() >= MAX_NAME || bytes.contains(&0) {
        return None;
    }
    let mut buf = [0u8; MAX_NAME];
    buf[..bytes.len()].copy_from_slice(bytes);
    // SAFETY: `buf` is NUL-terminated; getenv returns null or a pointer into
    // the environment block, which lives for the rest of the process as long
    // as nobody calls setenv on the same name.
    unsafe {
        let raw = libc::getenv(buf.as_ptr().cast());
        if raw.is_null() {
            return None;
        }
        CStr::from_ptr(raw).to_str().ok()
    }
}

pub fn config_from_env() -> EngineConfig {
    EngineConfig::from_lookup(getenv)
}

/// Output directory for the statistics reporter, if one was asked for.
pub fn stats_dir() -> Option<&'static str> {
    getenv(ENV_STATS_DIR).filter(|dir| !dir.trim().is_empty())
}
