//! CLI entrypoint for the mcmalloc harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mcmalloc_harness::classes::ClassTable;
use mcmalloc_harness::structured_log::{ArtifactIndex, validate_log_file};
use mcmalloc_harness::{Scenario, StressConfig, run_stress, run_to_dir};

/// Scenario and stress tooling for mcmalloc.
#[derive(Debug, Parser)]
#[command(name = "mcmalloc-harness")]
#[command(about = "Scenario, stress and size-class tooling for mcmalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run allocator scenarios and write log, report and artifact index.
    Scenario {
        /// Scenarios to run; all of them when omitted.
        #[arg(value_enum)]
        scenarios: Vec<Scenario>,
        /// Output directory.
        #[arg(long, default_value = "target/mcmalloc-harness")]
        out: PathBuf,
        /// Run id used in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Run the seeded multi-threaded stress workload.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 100_000)]
        ops: usize,
        /// Largest request in bytes.
        #[arg(long, default_value_t = 16 * 1024)]
        max_size: usize,
        #[arg(long, default_value_t = 1024)]
        working_set: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x5EED_CAFE")]
        seed: String,
        #[arg(long, default_value_t = 1)]
        partitions: usize,
        /// Echo engine lifecycle events to stderr.
        #[arg(long)]
        verbose: bool,
        /// Write the JSON report here instead of stdout.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the size-class table, optionally after learning sizes.
    Classes {
        /// Sizes to learn, in order.
        #[arg(long = "learn", num_args = 1..)]
        learn: Vec<usize>,
    },
    /// Validate a JSONL log file.
    ValidateLog {
        path: PathBuf,
    },
    /// Re-hash every artifact listed in an index.
    CheckIndex {
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenario {
            scenarios,
            out,
            run_id,
        } => {
            let scenarios = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
            };
            let (summary, paths) = run_to_dir(&out, &run_id, &scenarios)?;
            for report in &summary.reports {
                let verdict = if report.passed { "PASS" } else { "FAIL" };
                eprintln!("[{verdict}] {}: {}", report.scenario, report.title);
                for check in report.checks.iter().filter(|c| !c.passed) {
                    eprintln!("    {} ({})", check.name, check.detail);
                }
            }
            eprintln!(
                "Scenarios complete: total={}, passed={}, failed={}",
                summary.total, summary.passed, summary.failed
            );
            eprintln!("Log: {}", paths.log.display());
            eprintln!("Report: {}", paths.report.display());
            eprintln!("Index: {}", paths.index.display());
            if !summary.all_passed() {
                return Err("Scenario verification failed".into());
            }
        }
        Command::Stress {
            threads,
            ops,
            max_size,
            working_set,
            seed,
            partitions,
            verbose,
            report,
        } => {
            let cfg = StressConfig {
                threads,
                ops_per_thread: ops,
                max_size,
                working_set,
                seed: parse_seed(&seed)?,
                shard_partitions: partitions,
                verbose,
            };
            let result = run_stress(&cfg)?;
            let body = serde_json::to_string_pretty(&result)?;
            match report {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, body)?;
                    eprintln!("Wrote stress report to {}", path.display());
                }
                None => println!("{body}"),
            }
            eprintln!(
                "Stress complete: {} ops in {} ms ({:.0} ops/s), integrity failures={}",
                threads * ops,
                result.elapsed_ms,
                result.ops_per_sec,
                result.totals.integrity_failures
            );
            if !result.passed {
                return Err("Stress run failed".into());
            }
        }
        Command::Classes { learn } => {
            let ignored: Vec<_> = learn
                .iter()
                .filter(|&&s| !ClassTable::learnable(s))
                .collect();
            if !ignored.is_empty() {
                eprintln!("note: never learned: {ignored:?}");
            }
            let table = ClassTable::learning(&learn);
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::ValidateLog { path } => {
            let (lines, errors) = validate_log_file(&path)?;
            for err in &errors {
                eprintln!("{err}");
            }
            eprintln!("{}: {lines} lines, {} errors", path.display(), errors.len());
            if !errors.is_empty() {
                return Err("Log validation failed".into());
            }
        }
        Command::CheckIndex { path } => {
            let index: ArtifactIndex = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            let stale = index.stale_entries();
            for entry in &stale {
                eprintln!("stale: {} ({})", entry.path, entry.kind);
            }
            eprintln!(
                "{}: {} artifacts, {} stale",
                path.display(),
                index.artifacts.len(),
                stale.len()
            );
            if !stale.is_empty() {
                return Err("Artifact index is stale".into());
            }
        }
    }

    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = raw.trim();
    let seed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let hex = hex.replace('_', "");
        u64::from_str_radix(&hex, 16)?
    } else {
        let dec = s.replace('_', "");
        dec.parse::<u64>()?
    };
    Ok(seed)
}
