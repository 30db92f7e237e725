//! Scenario runs written out as JSONL log, JSON report and artifact index.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::HarnessError;
use crate::scenarios::{Scenario, ScenarioReport, run_scenario};
use crate::structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome};

pub const LOG_FILE: &str = "scenarios.log.jsonl";
pub const REPORT_FILE: &str = "scenarios.report.json";
pub const INDEX_FILE: &str = "artifact_index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<ScenarioReport>,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Paths written by [`run_to_dir`].
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub log: PathBuf,
    pub report: PathBuf,
    pub index: PathBuf,
}

impl RunArtifacts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log: dir.join(LOG_FILE),
            report: dir.join(REPORT_FILE),
            index: dir.join(INDEX_FILE),
        }
    }
}

/// Log one finished scenario: engine records first, then one entry per check
/// and a closing verdict.
pub fn log_scenario(emitter: &mut LogEmitter, report: &ScenarioReport) -> std::io::Result<()> {
    emitter.emit_records(&report.scenario, &report.records)?;
    for check in &report.checks {
        let (level, outcome) = if check.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        let entry = LogEntry::new(emitter.next_trace_id(), level, "check")
            .with_scenario(report.scenario.as_str())
            .with_outcome(outcome)
            .with_details(serde_json::json!({
                "name": check.name,
                "detail": check.detail,
            }));
        emitter.emit_entry(entry)?;
    }
    let (level, outcome) = if report.passed {
        (LogLevel::Info, Outcome::Pass)
    } else {
        (LogLevel::Error, Outcome::Fail)
    };
    let verdict = LogEntry::new(emitter.next_trace_id(), level, "scenario_done")
        .with_scenario(report.scenario.as_str())
        .with_outcome(outcome)
        .with_duration_ms(report.duration_ms)
        .with_details(serde_json::to_value(report.metrics)?);
    emitter.emit_entry(verdict)
}

/// Run `scenarios` and write the log, report and index into `dir`.
pub fn run_to_dir(
    dir: &Path,
    run_id: &str,
    scenarios: &[Scenario],
) -> Result<(RunSummary, RunArtifacts), HarnessError> {
    std::fs::create_dir_all(dir)?;
    let paths = RunArtifacts::in_dir(dir);
    let mut emitter = LogEmitter::to_file(&paths.log, run_id)?;
    emitter.emit(LogLevel::Info, "run_start")?;

    let mut reports = Vec::with_capacity(scenarios.len());
    for &scenario in scenarios {
        let report = run_scenario(scenario)?;
        log_scenario(&mut emitter, &report)?;
        reports.push(report);
    }
    emitter.flush()?;
    drop(emitter);

    let passed = reports.iter().filter(|r| r.passed).count();
    let summary = RunSummary {
        run_id: run_id.to_string(),
        total: reports.len(),
        passed,
        failed: reports.len() - passed,
        reports,
    };
    std::fs::write(&paths.report, serde_json::to_string_pretty(&summary)?)?;

    let mut index = ArtifactIndex::new(run_id);
    index
        .add_file(&paths.log, "log")?
        .add_file(&paths.report, "report")?;
    std::fs::write(&paths.index, index.to_json()?)?;
    Ok((summary, paths))
}
