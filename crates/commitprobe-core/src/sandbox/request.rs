//! Execution request and result types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::syntax::Language;

/// A file materialized inside the sandbox, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFile {
    pub path: String,
    pub contents: String,
}

impl SandboxFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// One test execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Relative path of the test file (also present in `files`).
    pub test_file: String,
    /// Relative path of the source file the unit lives in.
    pub target_file: String,
    pub language: Option<Language>,
    pub files: Vec<SandboxFile>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `None` when killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Output exceeded the policy cap and was cut.
    pub truncated: bool,
    /// Lines of `target_file` that executed, when the harness reports them.
    pub executed_lines: Option<Vec<u32>>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            executed_lines: None,
            duration_ms: 0,
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            duration_ms,
            ..Self::exited(0)
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_executed_lines(mut self, lines: Vec<u32>) -> Self {
        self.executed_lines = Some(lines);
        self
    }

    /// Combined output, stdout first.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_joins_streams() {
        let mut r = ExecutionResult::exited(1).with_stderr("boom");
        assert_eq!(r.output(), "boom");
        r.stdout = "ran 1 test".to_string();
        assert_eq!(r.output(), "ran 1 test\nboom");
    }

    #[test]
    fn test_timeout_has_no_exit_code() {
        let r = ExecutionResult::timeout(30_000);
        assert!(r.timed_out);
        assert_eq!(r.exit_code, None);
        assert_eq!(r.duration_ms, 30_000);
    }
}
