//! # mcmalloc-core
//!
//! Allocation policy for mcmalloc, free of `unsafe`.
//!
//! This crate decides *what* the allocator does: which size class a request
//! lands in, how many chunks a refill carves, how large an OS mapping is,
//! when a thread cache sheds segments to the shared pool. The runtime in
//! `mcmalloc-membrane` owns memory and applies these decisions.

#![deny(unsafe_code)]

pub mod batch;
pub mod classifier;
pub mod config;
pub mod error;
pub mod layout;
pub mod size_class;
pub mod stats;

pub use classifier::{Classification, LearnEntry, LearnEvent, SizeClassifier};
pub use config::EngineConfig;
pub use error::MallocError;
pub use stats::{CallStats, CallStatsSnapshot};
