//! Pipeline runs and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::assessment::RiskAssessment;
use super::test_case::{SynthesizedTest, TestOutcome};
use super::unit::{CommitUnit, UnitId};
use crate::aggregate::AggregatedRisk;

/// State of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Extracting,
    Scoring,
    Aggregating,
    Synthesizing,
    Running,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    /// The state that follows this one on the happy path.
    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Extracting => Some(RunState::Scoring),
            RunState::Scoring => Some(RunState::Aggregating),
            RunState::Aggregating => Some(RunState::Synthesizing),
            RunState::Synthesizing => Some(RunState::Running),
            RunState::Running => Some(RunState::Reporting),
            RunState::Reporting => Some(RunState::Done),
            RunState::Done | RunState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Transitions are strictly sequential; `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RunState::Failed || self.next() == Some(to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Extracting => "extracting",
            RunState::Scoring => "scoring",
            RunState::Aggregating => "aggregating",
            RunState::Synthesizing => "synthesizing",
            RunState::Running => "running",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in [`RunState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// State the run was in when it failed.
    pub state: RunState,
    pub reason: String,
}

/// A unit whose test could not be synthesized in this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisFailure {
    pub unit: UnitId,
    /// Failure kind, e.g. `synthesis_rejected`.
    pub kind: String,
    pub reason: String,
}

/// One pipeline run over one commit. Owns everything produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub commit: String,
    pub prompt_version: String,
    pub state: RunState,
    pub state_history: Vec<RunState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub failure: Option<RunFailure>,
    /// Units in extraction order.
    pub units: Vec<CommitUnit>,
    /// Assessments in unit order; units skipped by cancellation have none.
    pub assessments: Vec<RiskAssessment>,
    pub aggregated: Option<AggregatedRisk>,
    pub tests: Vec<SynthesizedTest>,
    pub synthesis_failures: Vec<SynthesisFailure>,
    pub outcomes: Vec<TestOutcome>,
}

impl PipelineRun {
    /// Create a run in the `Extracting` state.
    pub fn new(commit: impl Into<String>, prompt_version: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            commit: commit.into(),
            prompt_version: prompt_version.into(),
            state: RunState::Extracting,
            state_history: vec![RunState::Extracting],
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            failure: None,
            units: Vec::new(),
            assessments: Vec::new(),
            aggregated: None,
            tests: Vec::new(),
            synthesis_failures: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Move to `to`. Returns `false` (and stays put) for an illegal transition.
    pub fn transition(&mut self, to: RunState) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.state = to;
        self.state_history.push(to);
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Move to `Failed`, recording the state the failure happened in.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let state = self.state;
        if self.transition(RunState::Failed) {
            self.failure = Some(RunFailure {
                state,
                reason: reason.into(),
            });
        }
    }

    pub fn assessment_for(&self, unit: &UnitId) -> Option<&RiskAssessment> {
        self.assessments.iter().find(|a| &a.unit == unit)
    }

    pub fn test_for(&self, unit: &UnitId) -> Option<&SynthesizedTest> {
        self.tests.iter().find(|t| &t.unit == unit)
    }

    pub fn outcome_for(&self, unit: &UnitId) -> Option<&TestOutcome> {
        self.outcomes.iter().find(|o| &o.unit == unit)
    }

    pub fn synthesis_failure_for(&self, unit: &UnitId) -> Option<&SynthesisFailure> {
        self.synthesis_failures.iter().find(|f| &f.unit == unit)
    }

    pub fn degraded_count(&self) -> usize {
        self.assessments.iter().filter(|a| a.is_degraded()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_sequential() {
        let mut run = PipelineRun::new("abc", "v1");
        for to in [
            RunState::Scoring,
            RunState::Aggregating,
            RunState::Synthesizing,
            RunState::Running,
            RunState::Reporting,
            RunState::Done,
        ] {
            assert!(run.transition(to), "transition to {to} rejected");
        }
        assert!(run.finished_at.is_some());
        assert_eq!(run.state_history.len(), 7);
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut run = PipelineRun::new("abc", "v1");
        assert!(!run.transition(RunState::Synthesizing));
        assert_eq!(run.state, RunState::Extracting);
    }

    #[test]
    fn test_failed_reachable_from_any_working_state() {
        let mut run = PipelineRun::new("abc", "v1");
        run.transition(RunState::Scoring);
        run.fail("cache conflict");
        assert_eq!(run.state, RunState::Failed);
        let failure = run.failure.expect("failure recorded");
        assert_eq!(failure.state, RunState::Scoring);
        assert!(failure.reason.contains("cache conflict"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = PipelineRun::new("abc", "v1");
        run.fail("boom");
        assert!(!run.transition(RunState::Scoring));
        run.fail("again");
        assert_eq!(run.failure.unwrap().reason, "boom");
    }

    #[test]
    fn test_run_state_serde() {
        let json = serde_json::to_string(&RunState::Synthesizing).expect("serialize");
        assert_eq!(json, "\"synthesizing\"");
        let back: RunState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, RunState::Synthesizing);
    }
}
