//! Runtime configuration.
//!
//! Values come from environment variables. Parsing works on plain `&str` so
//! the runtime can feed it strings read with `getenv` without touching the
//! heap. Blank or malformed values fall back to the defaults.

pub const ENV_THREADS: &str = "MCMALLOC_THREADS";
pub const ENV_SHARD_PARTITIONS: &str = "MCMALLOC_SHARD_PARTITIONS";
pub const ENV_VERBOSE: &str = "MCMALLOC_VERBOSE";
pub const ENV_STATS_DIR: &str = "MCMALLOC_STATS_DIR";
pub const ENV_STATS_INTERVAL_MS: &str = "MCMALLOC_STATS_INTERVAL_MS";

pub const DEFAULT_THREAD_CAPACITY: usize = 128;
pub const MIN_THREAD_CAPACITY: usize = 2;
pub const MAX_THREAD_CAPACITY: usize = 1024;

pub const DEFAULT_SHARD_PARTITIONS: usize = 1;
pub const MAX_SHARD_PARTITIONS: usize = 64;

pub const DEFAULT_STATS_INTERVAL_MS: u64 = 250;

/// Engine tuning, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows in the cache matrix, including the main thread's.
    pub thread_capacity: usize,
    /// Overflow shards per size class.
    pub shard_partitions: usize,
    /// Echo lifecycle events at `Info` and above to stderr.
    pub verbose: bool,
    /// Period of the statistics reporter.
    pub stats_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_capacity: DEFAULT_THREAD_CAPACITY,
            shard_partitions: DEFAULT_SHARD_PARTITIONS,
            verbose: false,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Resolve a config from a variable lookup (normally the environment).
    pub fn from_lookup<'a, F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut config = Self::default();
        if let Some(n) = lookup(ENV_THREADS).and_then(parse_count) {
            config = config.with_thread_capacity(n);
        }
        if let Some(n) = lookup(ENV_SHARD_PARTITIONS).and_then(parse_count) {
            config = config.with_shard_partitions(n);
        }
        if let Some(v) = lookup(ENV_VERBOSE).and_then(parse_bool) {
            config.verbose = v;
        }
        if let Some(ms) = lookup(ENV_STATS_INTERVAL_MS).and_then(parse_count) {
            config.stats_interval_ms = (ms as u64).max(1);
        }
        config
    }

    #[must_use]
    pub fn with_thread_capacity(mut self, n: usize) -> Self {
        self.thread_capacity = n.clamp(MIN_THREAD_CAPACITY, MAX_THREAD_CAPACITY);
        self
    }

    #[must_use]
    pub fn with_shard_partitions(mut self, n: usize) -> Self {
        self.shard_partitions = n.clamp(1, MAX_SHARD_PARTITIONS);
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// `TRUE|T|true|t|1` or `FALSE|F|false|f|0`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "TRUE" | "T" | "true" | "t" | "1" => Some(true),
        "FALSE" | "F" | "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_count(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}
