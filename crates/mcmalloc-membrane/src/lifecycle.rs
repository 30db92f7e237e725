//! Structured lifecycle log for engine slow paths.
//!
//! Records go into a fixed ring so logging never allocates. Only rare events
//! are recorded: learned classes, shard traffic, refills, thread attach and
//! detach. Events below the log's minimum level are dropped before the ring
//! lock is taken. The newest [`LIFECYCLE_LOG_CAPACITY`] records survive.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::fatal::{StackWriter, write_stderr};

pub const LIFECYCLE_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleRecord {
    pub decision_id: u64,
    pub level: LogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub class: Option<usize>,
    pub size: Option<usize>,
    pub thread: Option<usize>,
    pub outcome: &'static str,
    /// Event-specific quantity: chunks carved, segments moved, range start.
    pub detail: u64,
}

impl LifecycleRecord {
    /// `mcmalloc::<symbol>::<decision_id>` in fixed-width hex.
    pub fn trace_id(&self) -> String {
        format!("mcmalloc::{}::{:016x}", self.symbol, self.decision_id)
    }
}

/// Fields of a record before it is stamped with a decision id.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleEvent {
    pub level: LogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub class: Option<usize>,
    pub size: Option<usize>,
    pub thread: Option<usize>,
    pub outcome: &'static str,
    pub detail: u64,
}

impl LifecycleEvent {
    pub const fn new(level: LogLevel, symbol: &'static str, event: &'static str) -> Self {
        Self {
            level,
            symbol,
            event,
            class: None,
            size: None,
            thread: None,
            outcome: "ok",
            detail: 0,
        }
    }

    pub const fn class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    pub const fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub const fn thread(mut self, thread: usize) -> Self {
        self.thread = Some(thread);
        self
    }

    pub const fn outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    pub const fn detail(mut self, detail: u64) -> Self {
        self.detail = detail;
        self
    }
}

struct Ring {
    records: [Option<LifecycleRecord>; LIFECYCLE_LOG_CAPACITY],
    head: usize,
    len: usize,
}

impl Ring {
    fn iter_ordered(&self) -> impl Iterator<Item = LifecycleRecord> + '_ {
        let start = (self.head + LIFECYCLE_LOG_CAPACITY - self.len) % LIFECYCLE_LOG_CAPACITY;
        (0..self.len).filter_map(move |i| self.records[(start + i) % LIFECYCLE_LOG_CAPACITY])
    }
}

pub struct LifecycleLog {
    ring: Mutex<Ring>,
    next_id: AtomicU64,
    overwritten: AtomicU64,
    min_level: LogLevel,
    echo: bool,
}

impl LifecycleLog {
    /// Keep events at `min_level` and above; echo kept `Info`+ events to
    /// stderr when `echo` is set.
    pub fn new(min_level: LogLevel, echo: bool) -> Self {
        Self {
            ring: Mutex::new(Ring {
                records: [None; LIFECYCLE_LOG_CAPACITY],
                head: 0,
                len: 0,
            }),
            next_id: AtomicU64::new(1),
            overwritten: AtomicU64::new(0),
            min_level,
            echo,
        }
    }

    /// Everything when verbose, otherwise `Info` and above with no echo.
    pub fn for_verbosity(verbose: bool) -> Self {
        let min_level = if verbose { LogLevel::Trace } else { LogLevel::Info };
        Self::new(min_level, verbose)
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Stamp and store `event`, returning its decision id, or `None` when the
    /// level is filtered out.
    pub fn record(&self, event: LifecycleEvent) -> Option<u64> {
        if !self.enabled(event.level) {
            return None;
        }
        let decision_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = LifecycleRecord {
            decision_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            class: event.class,
            size: event.size,
            thread: event.thread,
            outcome: event.outcome,
            detail: event.detail,
        };
        {
            let mut ring = self.ring.lock();
            let head = ring.head;
            ring.records[head] = Some(record);
            ring.head = (head + 1) % LIFECYCLE_LOG_CAPACITY;
            if ring.len == LIFECYCLE_LOG_CAPACITY {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            } else {
                ring.len += 1;
            }
        }
        if self.echo && record.level >= LogLevel::Info {
            echo(&record);
        }
        Some(decision_id)
    }

    /// Records currently held, oldest first.
    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.ring.lock().iter_ordered().collect()
    }

    /// Take every held record, oldest first.
    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        let mut ring = self.ring.lock();
        let out = ring.iter_ordered().collect();
        ring.len = 0;
        out
    }

    /// Records lost to ring wrap-around.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

fn echo(record: &LifecycleRecord) {
    let mut w = StackWriter::<192>::new();
    let _ = write!(
        w,
        "mcmalloc: [{}] {}::{} outcome={}",
        record.level.as_str(),
        record.symbol,
        record.event,
        record.outcome
    );
    if let Some(class) = record.class {
        let _ = write!(w, " class={class}");
    }
    if let Some(size) = record.size {
        let _ = write!(w, " size={size}");
    }
    if let Some(thread) = record.thread {
        let _ = write!(w, " thread={thread}");
    }
    let _ = writeln!(w, " detail={}", record.detail);
    write_stderr(w.as_bytes());
}
