//! Seeded multi-threaded stress workload.
//!
//! Every worker runs a deterministic mix of allocations, releases and
//! reallocations, tagging each payload and checking the tag on release.
//! Whatever a worker still holds at the end is handed to the coordinating
//! thread and released there, so every run also exercises cross-thread frees.

use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use mcmalloc_membrane::{Allocation, Engine, EngineConfig, ThreadContext};

use crate::HarnessError;
use crate::scenarios::MetricsSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Largest request, in bytes.
    pub max_size: usize,
    /// Live blocks a worker may hold before it starts releasing.
    pub working_set: usize,
    pub seed: u64,
    pub shard_partitions: usize,
    /// Echo engine lifecycle events to stderr and keep debug records.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 100_000,
            max_size: 16 * 1024,
            working_set: 1024,
            seed: 0x5EED_CAFE,
            shard_partitions: 1,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub allocations: u64,
    pub releases: u64,
    pub reallocations: u64,
    pub aligned: u64,
    pub integrity_failures: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.allocations += other.allocations;
        self.releases += other.releases;
        self.reallocations += other.reallocations;
        self.aligned += other.aligned;
        self.integrity_failures += other.integrity_failures;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub totals: WorkerReport,
    pub handed_over: u64,
    pub elapsed_ms: u64,
    pub ops_per_sec: f64,
    pub metrics: MetricsSummary,
    pub passed: bool,
}

/// Linear congruential generator (Knuth's MMIX constants).
#[derive(Debug, Clone, Copy)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed ^ 0x9E37_79B9_7F4A_7C15)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

struct Held {
    block: Allocation,
    len: usize,
    tag: u8,
}

fn tagged(mut block: Allocation, len: usize, tag: u8) -> Held {
    block.as_mut_slice()[..len].fill(tag);
    Held { block, len, tag }
}

fn intact(held: &Held) -> bool {
    held.block.as_slice()[..held.len].iter().all(|&b| b == held.tag)
}

fn churn(
    ctx: &mut ThreadContext<'_>,
    cfg: &StressConfig,
    rng: &mut Lcg,
    report: &mut WorkerReport,
    live: &mut Vec<Held>,
    ops: usize,
) -> Result<(), HarnessError> {
    for op in 0..ops {
        let tag = (op as u8) | 1;
        let roll = rng.below(100);
        if live.len() < cfg.working_set && (roll < 50 || live.is_empty()) {
            let size = 1 + rng.below(cfg.max_size);
            let block = if roll % 16 == 0 {
                report.aligned += 1;
                let alignment = 16 << rng.below(8);
                let b = ctx.allocate_aligned(alignment, size)?;
                if b.addr() % alignment != 0 {
                    report.integrity_failures += 1;
                }
                b
            } else {
                ctx.allocate(size)?
            };
            report.allocations += 1;
            live.push(tagged(block, size, tag));
        } else if roll < 85 {
            let held = live.swap_remove(rng.below(live.len()));
            if !intact(&held) {
                report.integrity_failures += 1;
            }
            ctx.release(held.block)?;
            report.releases += 1;
        } else {
            let idx = rng.below(live.len());
            let held = live.swap_remove(idx);
            if !intact(&held) {
                report.integrity_failures += 1;
            }
            let size = 1 + rng.below(cfg.max_size);
            let keep = held.len.min(size);
            let block = ctx.reallocate(held.block, size)?;
            if block.as_slice()[..keep].iter().any(|&b| b != held.tag) {
                report.integrity_failures += 1;
            }
            report.reallocations += 1;
            live.push(tagged(block, size, tag));
        }
    }
    Ok(())
}

/// Release every block still held and hand back `err`.
fn abandon(
    ctx: &mut ThreadContext<'_>,
    live: &mut Vec<Held>,
    err: HarnessError,
) -> HarnessError {
    for held in live.drain(..) {
        // Later release errors are dropped in favor of `err`.
        let _ = ctx.release(held.block);
    }
    err
}

fn worker(
    ctx: &mut ThreadContext<'_>,
    cfg: &StressConfig,
    seed: u64,
) -> Result<(WorkerReport, Vec<Held>), HarnessError> {
    let mut rng = Lcg::new(seed);
    let mut report = WorkerReport::default();
    let mut live: Vec<Held> = Vec::with_capacity(cfg.working_set);
    match churn(ctx, cfg, &mut rng, &mut report, &mut live, cfg.ops_per_thread) {
        Ok(()) => Ok((report, live)),
        Err(err) => Err(abandon(ctx, &mut live, err)),
    }
}

/// Run the workload on a fresh engine sized for `cfg.threads` workers.
pub fn run_stress(cfg: &StressConfig) -> Result<StressReport, HarnessError> {
    if cfg.threads == 0 || cfg.max_size == 0 || cfg.working_set == 0 {
        return Err(HarnessError::InvalidConfig(
            "threads, max_size and working_set must be positive",
        ));
    }
    let engine = Engine::new(
        EngineConfig::default()
            .with_thread_capacity(cfg.threads + 2)
            .with_shard_partitions(cfg.shard_partitions)
            .with_verbose(cfg.verbose),
    )?;
    let started = Instant::now();

    let results = thread::scope(|s| {
        let handles: Vec<_> = (0..cfg.threads)
            .map(|t| {
                let engine = &engine;
                s.spawn(move || -> Result<_, HarnessError> {
                    let mut ctx = engine.attach()?;
                    worker(&mut ctx, cfg, cfg.seed.wrapping_add(t as u64))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| HarnessError::WorkerPanicked("stress worker".into()))?
            })
            .collect::<Result<Vec<_>, HarnessError>>()
    })?;

    let mut totals = WorkerReport::default();
    let mut handed_over = 0u64;
    {
        let mut ctx = engine.attach()?;
        for (report, leftovers) in results {
            totals.merge(&report);
            for held in leftovers {
                if !intact(&held) {
                    totals.integrity_failures += 1;
                }
                ctx.release(held.block)?;
                handed_over += 1;
            }
        }
    }

    let elapsed = started.elapsed();
    let ops = (cfg.threads * cfg.ops_per_thread) as f64;
    let metrics = MetricsSummary::of(&engine);
    let passed = totals.integrity_failures == 0 && metrics.total_malloc == metrics.total_free;
    Ok(StressReport {
        config: *cfg,
        totals,
        handed_over,
        elapsed_ms: elapsed.as_millis() as u64,
        ops_per_sec: ops / elapsed.as_secs_f64().max(1e-9),
        metrics,
        passed,
    })
}
