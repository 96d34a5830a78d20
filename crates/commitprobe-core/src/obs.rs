//! Structured lifecycle events for pipeline runs.
//!
//! - `RunSpan` tags everything logged during a run with its `run_id`
//! - `emit_*` functions log the key lifecycle events at `info!`/`warn!`
//!
//! Verbosity follows `RUST_LOG`; JSON output is selected by the CLI.

use tracing::{info, warn};

use crate::domain::run::RunState;

/// RAII guard that enters a run-scoped tracing span.
///
/// ```ignore
/// let _span = RunSpan::enter("6f1c...", "abc123");
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, commit: &str) -> Self {
        Self {
            _span: Self::span(run_id, commit).entered(),
        }
    }

    /// The span itself, for instrumenting futures that cross `.await`.
    pub fn span(run_id: &str, commit: &str) -> tracing::Span {
        tracing::info_span!("commitprobe.run", run_id = %run_id, commit = %commit)
    }
}

pub fn emit_run_started(run_id: &str, commit: &str, prompt_version: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        commit = %commit,
        prompt_version = %prompt_version,
    );
}

pub fn emit_state_changed(run_id: &str, from: RunState, to: RunState) {
    info!(
        event = "run.state_changed",
        run_id = %run_id,
        from = from.as_str(),
        to = to.as_str(),
    );
}

/// A unit's assessment fell back to the default score.
pub fn emit_unit_degraded(unit: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "unit.degraded", unit = %unit, reason = %reason);
}

pub fn emit_run_cancelled(run_id: &str, state: RunState) {
    warn!(event = "run.cancelled", run_id = %run_id, state = state.as_str());
}

pub fn emit_run_finished(
    run_id: &str,
    state: RunState,
    duration_ms: u64,
    units: usize,
    commit_score: Option<f64>,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        state = state.as_str(),
        duration_ms = duration_ms,
        units = units,
        commit_score = commit_score,
    );
}

pub fn emit_run_failed(run_id: &str, state: RunState, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, state = state.as_str(), error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id", "abc123");
        emit_state_changed("test-run-id", RunState::Extracting, RunState::Scoring);
    }
}
