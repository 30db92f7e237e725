//! Scenario and stress harness for mcmalloc.
//!
//! This crate provides:
//! - Concrete scenarios: the allocator's headline behaviours as pass/fail
//!   checks against a fresh engine each
//! - Stress workloads: seeded multi-threaded churn with payload integrity
//!   checks and cross-thread frees
//! - Class tables: the base scheme and what a classifier learns from a trace
//! - Structured logs: engine lifecycle records as JSONL, plus an artifact
//!   index with SHA-256 integrity
//! - Runs: a set of scenarios written out as log, report and index files
//!
//! Everything runs through the safe engine API.

#![forbid(unsafe_code)]

pub mod classes;
pub mod error;
pub mod run;
pub mod scenarios;
pub mod stress;
pub mod structured_log;

pub use error::HarnessError;
pub use run::{RunArtifacts, RunSummary, run_to_dir};
pub use scenarios::{CheckResult, MetricsSummary, Scenario, ScenarioReport, run_scenario};
pub use stress::{StressConfig, StressReport, run_stress};
