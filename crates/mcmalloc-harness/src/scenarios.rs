//! Concrete allocator scenarios as pass/fail checks.
//!
//! Each scenario builds its own [`Engine`], so metrics and lifecycle records
//! in a report belong to that scenario alone.

use std::collections::HashSet;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use mcmalloc_core::layout::CHUNK_HEADER_SIZE;
use mcmalloc_core::size_class;
use mcmalloc_membrane::{
    CallStatsSnapshot, Engine, EngineConfig, LifecycleRecord, MallocError, MetricsSnapshot,
};

use crate::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Scenario {
    /// Repeated 8-byte requests stay in the local cache.
    A,
    /// A large free backlog is offloaded and adopted by another thread.
    B,
    /// `realloc` to the same or a smaller size never moves.
    C,
    /// Aligned allocation keeps the header recoverable.
    D,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [Scenario::A, Scenario::B, Scenario::C, Scenario::D];

    pub const fn id(self) -> &'static str {
        match self {
            Scenario::A => "a",
            Scenario::B => "b",
            Scenario::C => "c",
            Scenario::D => "d",
        }
    }

    pub const fn title(self) -> &'static str {
        match self {
            Scenario::A => "small requests stay thread-local",
            Scenario::B => "backlog moves through the overflow pool",
            Scenario::C => "realloc does not move on same or smaller size",
            Scenario::D => "aligned allocation recovers its header",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Serializable view of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub shard_probes: u64,
    pub shard_adopts: u64,
    pub shard_offloads: u64,
    pub bulk_refills: u64,
    pub chunks_carved: u64,
    pub region_maps: u64,
    pub region_bytes: u64,
    pub region_unmaps: u64,
    pub detached_chunks: u64,
    pub learned_classes: u64,
    pub total_malloc: u64,
    pub total_free: u64,
}

impl MetricsSummary {
    pub fn new(m: &MetricsSnapshot, stats: &CallStatsSnapshot) -> Self {
        Self {
            shard_probes: m.shard_probes,
            shard_adopts: m.shard_adopts,
            shard_offloads: m.shard_offloads,
            bulk_refills: m.bulk_refills,
            chunks_carved: m.chunks_carved,
            region_maps: m.region_maps,
            region_bytes: m.region_bytes,
            region_unmaps: m.region_unmaps,
            detached_chunks: m.detached_chunks,
            learned_classes: m.learned_classes,
            total_malloc: stats.total_malloc(),
            total_free: stats.total_free(),
        }
    }

    pub fn of(engine: &Engine) -> Self {
        Self::new(&engine.metrics(), &engine.stats())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub title: String,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub metrics: MetricsSummary,
    pub duration_ms: u64,
    /// Engine lifecycle records; logged separately as JSONL.
    #[serde(skip)]
    pub records: Vec<LifecycleRecord>,
}

#[derive(Default)]
struct Checks(Vec<CheckResult>);

impl Checks {
    fn check(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        self.0.push(CheckResult {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        });
    }

    fn eq<T: PartialEq + std::fmt::Debug>(&mut self, name: &str, actual: T, expected: T) {
        let passed = actual == expected;
        self.check(name, passed, format!("actual={actual:?} expected={expected:?}"));
    }
}

/// Scenario engines keep every lifecycle level so the log shows shard traffic.
fn engine_for_scenario() -> Result<Engine, MallocError> {
    Engine::new(
        EngineConfig::default()
            .with_thread_capacity(8)
            .with_verbose(true),
    )
}

/// Run one scenario on a fresh engine.
pub fn run_scenario(scenario: Scenario) -> Result<ScenarioReport, HarnessError> {
    let started = Instant::now();
    let engine = engine_for_scenario()?;
    let mut checks = Checks::default();
    match scenario {
        Scenario::A => scenario_a(&engine, &mut checks)?,
        Scenario::B => scenario_b(&engine, &mut checks)?,
        Scenario::C => scenario_c(&engine, &mut checks)?,
        Scenario::D => scenario_d(&engine, &mut checks)?,
    }
    let checks = checks.0;
    Ok(ScenarioReport {
        scenario: scenario.id().to_string(),
        title: scenario.title().to_string(),
        passed: checks.iter().all(|c| c.passed),
        checks,
        metrics: MetricsSummary::of(&engine),
        duration_ms: started.elapsed().as_millis() as u64,
        records: engine.drain_lifecycle_logs(),
    })
}

fn scenario_a(engine: &Engine, checks: &mut Checks) -> Result<(), HarnessError> {
    let mut ctx = engine.attach()?;
    let mut addrs = HashSet::new();
    for _ in 0..10_000 {
        let a = ctx.allocate(8)?;
        addrs.insert(a.addr());
        ctx.release(a)?;
    }
    let m = engine.metrics();
    checks.eq("single_bulk_refill", m.bulk_refills, 1);
    checks.eq("one_shard_probe_on_first_miss", m.shard_probes, 1);
    checks.eq("no_shard_adopts", m.shard_adopts, 0);
    checks.eq("no_shard_offloads", m.shard_offloads, 0);
    checks.eq("same_chunk_recycled", addrs.len(), 1);
    Ok(())
}

fn scenario_b(engine: &Engine, checks: &mut Checks) -> Result<(), HarnessError> {
    const CHUNKS: usize = 10_000;
    const SIZE: usize = 8 * 1024;
    let class = size_class::class_of(SIZE);

    let released = thread::scope(|s| {
        s.spawn(|| -> Result<HashSet<usize>, HarnessError> {
            let mut ctx = engine.attach()?;
            let held = (0..CHUNKS)
                .map(|_| ctx.allocate(SIZE))
                .collect::<Result<Vec<_>, _>>()?;
            let addrs = held.iter().map(|a| a.addr()).collect();
            for a in held {
                ctx.release(a)?;
            }
            Ok(addrs)
        })
        .join()
        .map_err(|_| HarnessError::WorkerPanicked("scenario b releaser".into()))?
    })?;

    let segments = engine.shard_segments(class);
    checks.check(
        "backlog_offloaded",
        segments >= 1,
        format!("shard segments for class {class}: {segments}"),
    );

    let adopted = thread::scope(|s| {
        s.spawn(|| -> Result<usize, HarnessError> {
            let mut ctx = engine.attach()?;
            let a = ctx.allocate(SIZE)?;
            let addr = a.addr();
            ctx.release(a)?;
            Ok(addr)
        })
        .join()
        .map_err(|_| HarnessError::WorkerPanicked("scenario b adopter".into()))?
    })?;
    checks.check(
        "second_thread_adopts",
        released.contains(&adopted),
        format!("address {adopted:#x} came from the released backlog"),
    );
    checks.check(
        "adopt_counted",
        engine.metrics().shard_adopts >= 1,
        format!("shard_adopts={}", engine.metrics().shard_adopts),
    );
    Ok(())
}

fn scenario_c(engine: &Engine, checks: &mut Checks) -> Result<(), HarnessError> {
    let mut ctx = engine.attach()?;
    let mut a = ctx.allocate(300)?;
    let addr = a.addr();
    let usable = a.usable_size();
    a.as_mut_slice().fill(0xC3);

    let a = ctx.reallocate(a, usable)?;
    checks.eq("same_size_keeps_pointer", a.addr(), addr);
    let a = ctx.reallocate(a, usable - 1)?;
    checks.eq("smaller_size_keeps_pointer", a.addr(), addr);

    let a = ctx.reallocate(a, usable * 2)?;
    checks.check(
        "growth_preserves_payload",
        a.as_slice()[..usable].iter().all(|&b| b == 0xC3),
        format!("copied {usable} bytes"),
    );
    ctx.release(a)?;
    Ok(())
}

fn scenario_d(engine: &Engine, checks: &mut Checks) -> Result<(), HarnessError> {
    let mut ctx = engine.attach()?;
    let a = ctx.allocate_aligned(64, 100)?;
    let addr = a.addr();
    let header = a.header_addr();
    let expected_class = size_class::class_of(100 + 64);
    checks.eq("aligned_to_64", addr % 64, 0);
    checks.eq("class_of_padded_request", a.class_index(), expected_class);
    checks.check(
        "header_precedes_payload",
        addr >= header + CHUNK_HEADER_SIZE && addr - header - CHUNK_HEADER_SIZE < 64,
        format!("header={header:#x} data={addr:#x}"),
    );
    checks.check(
        "usable_covers_request",
        a.usable_size() >= 100,
        format!("usable={}", a.usable_size()),
    );
    ctx.release(a)?;

    // Released chunks lose their alignment offset.
    let b = ctx.allocate(164)?;
    checks.eq("same_chunk_reused", b.header_addr(), header);
    checks.eq("offset_cleared", b.addr(), header + CHUNK_HEADER_SIZE);
    ctx.release(b)?;
    Ok(())
}
