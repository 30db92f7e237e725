//! Heap-free diagnostics: the abort path and stderr echo.
//!
//! Nothing in here may allocate. These run inside `malloc`, sometimes because
//! `malloc` itself is broken.

use std::fmt::{self, Write};

use mcmalloc_core::MallocError;

/// `fmt::Write` into a fixed stack buffer. Output past the end is dropped.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let take = s.len().min(N - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Write raw bytes to fd 2, retrying on partial writes.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice; fd 2 may be closed, which only
        // makes the call fail.
        let n = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Report `err` and abort the process.
#[cold]
pub fn fatal(err: &MallocError) -> ! {
    let mut w = StackWriter::<256>::new();
    let _ = writeln!(w, "mcmalloc: fatal: {err}");
    write_stderr(w.as_bytes());
    std::process::abort()
}
