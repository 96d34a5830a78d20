use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{aggregate_residual, residual_risk, FileRisk};
use crate::config::EngineConfig;
use crate::domain::assessment::AssessmentSource;
use crate::domain::run::{PipelineRun, RunFailure, RunState};
use crate::domain::test_case::TestVerdict;
use crate::domain::unit::{UnitId, UnitKind};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// How a unit's risk score was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Assessed,
    Cached,
    /// Default score after the model failed.
    Degraded,
    /// Not scored (run cancelled or failed first).
    Skipped,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Assessed => "assessed",
            UnitStatus::Cached => "cached",
            UnitStatus::Degraded => "degraded",
            UnitStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitReport {
    pub unit: UnitId,
    pub kind: UnitKind,
    pub fingerprint: String,
    pub status: UnitStatus,
    pub score: Option<f64>,
    pub tags: Vec<String>,
    pub test_file: Option<String>,
    /// `kind: reason` when synthesis was attempted and failed.
    pub synthesis_failure: Option<String>,
    pub verdict: Option<TestVerdict>,
    pub coverage_ratio: Option<f64>,
    pub residual_risk: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub units: usize,
    pub assessed: usize,
    pub cached: usize,
    pub degraded: usize,
    pub skipped: usize,
    pub tests_synthesized: usize,
    pub synthesis_failures: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    /// Error or timeout verdicts.
    pub tests_errored: usize,
}

/// Serializable outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: Uuid,
    pub commit: String,
    pub prompt_version: String,
    pub state: RunState,
    pub cancelled: bool,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub commit_score: f64,
    /// Commit score after feeding back test outcomes.
    pub residual_commit_score: f64,
    pub files: Vec<FileRisk>,
    /// In extraction order.
    pub units: Vec<UnitReport>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn from_run(run: &PipelineRun, config: &EngineConfig) -> Self {
        let mut summary = RunSummary {
            units: run.units.len(),
            tests_synthesized: run.tests.len(),
            synthesis_failures: run.synthesis_failures.len(),
            ..RunSummary::default()
        };

        let units: Vec<UnitReport> = run
            .units
            .iter()
            .map(|unit| {
                let assessment = run.assessment_for(&unit.id);
                let outcome = run.outcome_for(&unit.id);
                let status = match assessment.map(|a| a.source) {
                    Some(AssessmentSource::Model) => UnitStatus::Assessed,
                    Some(AssessmentSource::Cache) => UnitStatus::Cached,
                    Some(AssessmentSource::Degraded) => UnitStatus::Degraded,
                    None => UnitStatus::Skipped,
                };
                match status {
                    UnitStatus::Assessed => summary.assessed += 1,
                    UnitStatus::Cached => summary.cached += 1,
                    UnitStatus::Degraded => summary.degraded += 1,
                    UnitStatus::Skipped => summary.skipped += 1,
                }
                match outcome.map(|o| o.verdict) {
                    Some(TestVerdict::Pass) => summary.tests_passed += 1,
                    Some(TestVerdict::Fail) => summary.tests_failed += 1,
                    Some(TestVerdict::Error | TestVerdict::Timeout) => summary.tests_errored += 1,
                    None => {}
                }

                UnitReport {
                    unit: unit.id.clone(),
                    kind: unit.kind,
                    fingerprint: unit.fingerprint.to_string(),
                    status,
                    score: assessment.map(|a| a.score),
                    tags: assessment
                        .map(|a| a.tags.iter().cloned().collect())
                        .unwrap_or_default(),
                    test_file: run.test_for(&unit.id).map(|t| t.file_name.clone()),
                    synthesis_failure: run
                        .synthesis_failure_for(&unit.id)
                        .map(|f| format!("{}: {}", f.kind, f.reason)),
                    verdict: outcome.map(|o| o.verdict),
                    coverage_ratio: outcome.and_then(|o| o.coverage).map(|c| c.ratio()),
                    residual_risk: assessment.map(|a| residual_risk(a, outcome)),
                }
            })
            .collect();

        let residual = aggregate_residual(&run.units, &run.assessments, &run.outcomes, config);
        let (commit_score, files) = match &run.aggregated {
            Some(agg) => (agg.commit_score, agg.files.clone()),
            None => (0.0, Vec::new()),
        };

        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run.run_id,
            commit: run.commit.clone(),
            prompt_version: run.prompt_version.clone(),
            state: run.state,
            cancelled: run.cancelled,
            failure: run.failure.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            commit_score,
            residual_commit_score: residual.commit_score,
            files,
            units,
            summary,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Write the report as pretty JSON.
pub fn write_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn score(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

/// Render a markdown summary for PR comments and check output.
pub fn render_markdown(report: &RunReport) -> String {
    let mut out = String::new();
    let short = report.commit.get(..12).unwrap_or(&report.commit);
    let _ = writeln!(out, "# commitprobe: `{short}`\n");
    let _ = writeln!(
        out,
        "- state: {}{}",
        report.state,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    if let Some(failure) = &report.failure {
        let _ = writeln!(out, "- failure in {}: {}", failure.state, failure.reason);
    }
    let _ = writeln!(out, "- commit risk: {:.2}", report.commit_score);
    let _ = writeln!(out, "- residual risk: {:.2}", report.residual_commit_score);
    let s = &report.summary;
    let _ = writeln!(
        out,
        "- units: {} (assessed {}, cached {}, degraded {}, skipped {})",
        s.units, s.assessed, s.cached, s.degraded, s.skipped
    );
    let _ = writeln!(
        out,
        "- tests: {} synthesized, {} passed, {} failed, {} errored\n",
        s.tests_synthesized, s.tests_passed, s.tests_failed, s.tests_errored
    );

    if !report.files.is_empty() {
        out.push_str("## Files\n\n| file | risk | units | high risk |\n|---|---|---|---|\n");
        for file in &report.files {
            let _ = writeln!(
                out,
                "| `{}` | {:.2} | {} | {} |",
                file.path, file.score, file.unit_count, file.high_risk_units
            );
        }
        out.push('\n');
    }

    if !report.units.is_empty() {
        out.push_str("## Units\n\n| unit | status | risk | tags | test | residual |\n|---|---|---|---|---|---|\n");
        for unit in &report.units {
            let test = match (&unit.verdict, &unit.synthesis_failure) {
                (Some(verdict), _) => verdict.to_string(),
                (None, Some(_)) => "not synthesized".to_string(),
                (None, None) => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "| `{}` | {} | {} | {} | {} | {} |",
                unit.unit,
                unit.status.as_str(),
                score(unit.score),
                unit.tags.join(", "),
                test,
                score(unit.residual_risk)
            );
        }
    }
    out
}

/// Write the markdown summary.
pub fn write_markdown(path: &Path, report: &RunReport) -> Result<()> {
    let md = render_markdown(report);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
