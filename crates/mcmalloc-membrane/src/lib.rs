//! # mcmalloc-membrane
//!
//! Runtime engine for mcmalloc: everything that owns memory.
//!
//! - [`os`]: anonymous mappings and heap-free mapped tables
//! - [`region`]: per-thread region supplier carving spans from OS batches
//! - [`chunk`]: in-band chunk header and pointer-to-header recovery
//! - [`segment`]: the segmented stack used by caches and shards alike
//! - [`thread_cache`], [`registry`], [`shard`]: the cache matrix, thread
//!   index assignment and the shared overflow pool
//! - [`engine`]: the allocator itself, with a safe handle API and the raw
//!   pointer surface the C ABI is built on
//! - [`lifecycle`], [`metrics`], [`reporter`]: diagnostics
//!
//! Policy (size classes, batch sizing, configuration, errors) lives in
//! `mcmalloc-core`.

pub mod chunk;
pub mod engine;
pub mod env;
pub mod fatal;
pub mod lifecycle;
pub mod metrics;
pub mod os;
pub mod region;
pub mod registry;
pub mod reporter;
pub mod segment;
pub mod shard;
pub mod thread_cache;

pub use engine::{Allocation, Engine, ThreadContext};
pub use fatal::fatal;
pub use lifecycle::{LifecycleEvent, LifecycleLog, LifecycleRecord, LogLevel};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use reporter::{StatsReporter, StatsSource};

pub use mcmalloc_core::{CallStatsSnapshot, EngineConfig, MallocError};
