//! Background statistics reporter.
//!
//! Every interval the reporter thread takes a [`CallStatsSnapshot`] and
//! appends one sample to two files in the output directory:
//!
//! - [`CALL_STAT_FILE`]: a `# time=<ms>` line, then per bucket
//!   `bucket malloc free malloc-free max(malloc-free)`
//! - [`CALL_STAT_TOTAL_FILE`]: `time total_malloc total_free diff max_sum`
//!
//! [`StatsReporter::join`] wakes the thread at once, which writes a final
//! sample before exiting.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use mcmalloc_core::CallStatsSnapshot;
use mcmalloc_core::stats::StatsHistory;

use crate::engine::Engine;

pub const CALL_STAT_FILE: &str = "call-stat.txt";
pub const CALL_STAT_TOTAL_FILE: &str = "call-stat-total.txt";

/// Where the reporter reads its counters from.
pub trait StatsSource: Send + 'static {
    fn snapshot(&self) -> CallStatsSnapshot;

    /// Runs on the reporter thread after the final sample.
    fn on_exit(&self) {}
}

impl StatsSource for &'static Engine {
    fn snapshot(&self) -> CallStatsSnapshot {
        self.stats()
    }
}

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub struct StatsReporter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl StatsReporter {
    /// Create both output files in `dir` and start sampling.
    pub fn start<S: StatsSource>(dir: &Path, interval: Duration, source: S) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let buckets = BufWriter::new(File::create(dir.join(CALL_STAT_FILE))?);
        let totals = BufWriter::new(File::create(dir.join(CALL_STAT_TOTAL_FILE))?);
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("mcmalloc-stats".to_owned())
            .spawn(move || {
                let result = run(&thread_shared, interval, &source, buckets, totals);
                source.on_exit();
                result
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it. Returns the number of samples written.
    pub fn join(mut self) -> io::Result<u64> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> io::Result<u64> {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("stats reporter thread panicked"))?,
            None => Ok(0),
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

fn run<S: StatsSource>(
    shared: &Shared,
    interval: Duration,
    source: &S,
    mut buckets: BufWriter<File>,
    mut totals: BufWriter<File>,
) -> io::Result<u64> {
    let started = Instant::now();
    let mut history = StatsHistory::default();
    let mut samples = 0u64;
    let mut bucket_text = String::new();
    let mut total_text = String::new();
    loop {
        let stop = {
            let mut stop = shared.stop.lock();
            if !*stop {
                shared.wake.wait_for(&mut stop, interval);
            }
            *stop
        };

        bucket_text.clear();
        total_text.clear();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        history
            .record(elapsed_ms, &source.snapshot(), &mut bucket_text, &mut total_text)
            .map_err(|_| io::Error::other("formatting a stats sample failed"))?;
        buckets.write_all(bucket_text.as_bytes())?;
        totals.write_all(total_text.as_bytes())?;
        buckets.flush()?;
        totals.flush()?;
        samples += 1;

        if stop {
            return Ok(samples);
        }
    }
}
