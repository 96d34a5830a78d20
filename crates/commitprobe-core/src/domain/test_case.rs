//! Synthesized tests and their execution outcomes.

use serde::{Deserialize, Serialize};

use super::unit::UnitId;
use crate::syntax::Language;

/// Cacheable content of a synthesized test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestArtifact {
    pub file_name: String,
    pub language: Option<Language>,
    pub source: String,
}

/// A generated test targeting one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedTest {
    pub unit: UnitId,
    pub file_name: String,
    pub language: Option<Language>,
    pub source: String,
    /// Unit risk score that triggered synthesis.
    pub trigger_score: f64,
    /// Model prompts issued for this test (0 when served from cache).
    pub attempts: u32,
    pub from_cache: bool,
}

impl SynthesizedTest {
    pub fn from_artifact(
        unit: UnitId,
        artifact: TestArtifact,
        trigger_score: f64,
        attempts: u32,
        from_cache: bool,
    ) -> Self {
        Self {
            unit,
            file_name: artifact.file_name,
            language: artifact.language,
            source: artifact.source,
            trigger_score,
            attempts,
            from_cache,
        }
    }

    pub fn artifact(&self) -> TestArtifact {
        TestArtifact {
            file_name: self.file_name.clone(),
            language: self.language,
            source: self.source.clone(),
        }
    }
}

/// Execution verdict of a synthesized test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Pass,
    /// Assertion failure.
    Fail,
    /// Uncaught fault other than an assertion.
    Error,
    Timeout,
}

impl TestVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestVerdict::Pass => "pass",
            TestVerdict::Fail => "fail",
            TestVerdict::Error => "error",
            TestVerdict::Timeout => "timeout",
        }
    }

    /// Verdicts the runner may retry once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TestVerdict::Error | TestVerdict::Timeout)
    }
}

impl std::fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coverage attributable to the unit's own line range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageDelta {
    pub covered_lines: u32,
    pub total_lines: u32,
}

impl CoverageDelta {
    pub fn ratio(&self) -> f64 {
        if self.total_lines == 0 {
            0.0
        } else {
            f64::from(self.covered_lines) / f64::from(self.total_lines)
        }
    }
}

/// Terminal record of running one synthesized test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub unit: UnitId,
    pub test_file: String,
    pub verdict: TestVerdict,
    pub output: String,
    pub coverage: Option<CoverageDelta>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_ratio() {
        let c = CoverageDelta {
            covered_lines: 3,
            total_lines: 4,
        };
        assert!((c.ratio() - 0.75).abs() < f64::EPSILON);
        let empty = CoverageDelta {
            covered_lines: 0,
            total_lines: 0,
        };
        assert_eq!(empty.ratio(), 0.0);
    }

    #[test]
    fn test_only_error_and_timeout_are_retryable() {
        assert!(!TestVerdict::Pass.is_retryable());
        assert!(!TestVerdict::Fail.is_retryable());
        assert!(TestVerdict::Error.is_retryable());
        assert!(TestVerdict::Timeout.is_retryable());
    }

    #[test]
    fn test_verdict_serde_snake_case() {
        let json = serde_json::to_string(&TestVerdict::Timeout).expect("serialize");
        assert_eq!(json, "\"timeout\"");
    }
}
