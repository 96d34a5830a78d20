//! Domain models for commitprobe.
//!
//! Canonical definitions for the core entities:
//! - `CommitUnit`: a minimal analyzable piece of a commit
//! - `RiskAssessment`: model-inferred defect risk of one unit
//! - `SynthesizedTest` / `TestOutcome`: generated tests and their results
//! - `PipelineRun`: one run over one commit, owning all of the above

pub mod assessment;
pub mod error;
pub mod run;
pub mod test_case;
pub mod unit;

// Re-export main types and errors
pub use assessment::{AssessmentSource, RiskAssessment, RiskVerdict, UNKNOWN_TAG};
pub use error::{ProbeError, Result};
pub use run::{PipelineRun, RunFailure, RunState, SynthesisFailure};
pub use test_case::{CoverageDelta, SynthesizedTest, TestArtifact, TestOutcome, TestVerdict};
pub use unit::{CommitUnit, Fingerprint, Param, UnitId, UnitKind, UnitSignature};
