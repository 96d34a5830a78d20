//! Test runner: verdicts, one retry for flaky results, coverage attribution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::request::{ExecutionRequest, ExecutionResult, SandboxFile};
use super::SandboxExecutor;
use crate::cancel::CancelToken;
use crate::domain::test_case::{CoverageDelta, SynthesizedTest, TestOutcome, TestVerdict};
use crate::domain::unit::UnitId;
use crate::metrics::METRICS;

/// Executions per test: the first run plus one retry for error/timeout.
pub const MAX_TEST_ATTEMPTS: u32 = 2;

/// A synthesized test plus the tree it runs against: unchanged files
/// overlaid with the post-commit text of changed ones.
#[derive(Debug, Clone)]
pub struct TestJob {
    pub test: SynthesizedTest,
    pub sources: Arc<BTreeMap<String, String>>,
}

pub struct TestRunner {
    executor: Arc<dyn SandboxExecutor>,
    timeout: Duration,
}

impl TestRunner {
    pub fn new(executor: Arc<dyn SandboxExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn request(&self, job: &TestJob) -> ExecutionRequest {
        let mut files: Vec<SandboxFile> = job
            .sources
            .iter()
            .filter(|(path, _)| path.as_str() != job.test.file_name)
            .map(|(path, contents)| SandboxFile::new(path.clone(), contents.clone()))
            .collect();
        files.push(SandboxFile::new(job.test.file_name.clone(), job.test.source.clone()));
        ExecutionRequest {
            test_file: job.test.file_name.clone(),
            target_file: job.test.unit.path.clone(),
            language: job.test.language,
            files,
            timeout: self.timeout,
        }
    }

    /// Execute `job`. Error and timeout verdicts are retried once unless
    /// `cancel` fired in the meantime.
    pub async fn run(&self, job: &TestJob, cancel: &CancelToken) -> TestOutcome {
        let request = self.request(job);
        let unit = &job.test.unit;
        let mut attempts = 0;
        let mut duration_ms = 0;

        loop {
            attempts += 1;
            METRICS.inc_tests_executed();
            let (verdict, output, coverage) = match self.executor.execute(&request).await {
                Ok(result) => {
                    duration_ms += result.duration_ms;
                    (classify(&result), render_output(&result), attributed_coverage(unit, &result))
                }
                Err(err) => {
                    warn!(unit = %unit, error = %err, "sandbox execution failed");
                    (TestVerdict::Error, err.to_string(), None)
                }
            };
            debug!(unit = %unit, attempt = attempts, verdict = verdict.as_str(), "test executed");

            let retry = verdict.is_retryable() && attempts < MAX_TEST_ATTEMPTS && !cancel.is_cancelled();
            if !retry {
                return TestOutcome {
                    unit: unit.clone(),
                    test_file: job.test.file_name.clone(),
                    verdict,
                    output,
                    coverage,
                    attempts,
                    duration_ms,
                };
            }
        }
    }
}

/// Exit 0 passes, exit 1 is an assertion failure, anything else is an error.
pub fn classify(result: &ExecutionResult) -> TestVerdict {
    if result.timed_out {
        return TestVerdict::Timeout;
    }
    match result.exit_code {
        Some(0) => TestVerdict::Pass,
        Some(1) => TestVerdict::Fail,
        _ => TestVerdict::Error,
    }
}

fn render_output(result: &ExecutionResult) -> String {
    let mut out = result.output();
    if result.truncated {
        out.push_str("\n[output truncated]");
    }
    out
}

/// Executed lines that fall inside the unit's own range.
pub fn attributed_coverage(unit: &UnitId, result: &ExecutionResult) -> Option<CoverageDelta> {
    let lines = result.executed_lines.as_ref()?;
    let covered: BTreeSet<u32> = lines
        .iter()
        .copied()
        .filter(|line| unit.contains_line(*line))
        .collect();
    Some(CoverageDelta {
        covered_lines: u32::try_from(covered.len()).unwrap_or(u32::MAX),
        total_lines: unit.line_count(),
    })
}
