//! Risk assessments produced by the inference client.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::unit::{Fingerprint, UnitId};

/// Reserved tag marking an assessment the model could not produce.
pub const UNKNOWN_TAG: &str = "unknown";

/// Where an assessment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentSource {
    /// Fresh backend call.
    Model,
    /// Served from the fingerprint cache.
    Cache,
    /// Retries exhausted; score is the configured default.
    Degraded,
}

/// The content of a risk answer, independent of which unit asked for it.
///
/// This is what the fingerprint cache stores; two units with the same
/// fingerprint share one verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub score: f64,
    pub tags: BTreeSet<String>,
    pub model: String,
}

/// Risk score for one unit of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub unit: UnitId,
    pub fingerprint: Fingerprint,
    pub score: f64,
    pub tags: BTreeSet<String>,
    pub model: String,
    pub prompt_version: String,
    pub source: AssessmentSource,
}

impl RiskAssessment {
    /// Bind a verdict to a unit.
    pub fn from_verdict(
        unit: UnitId,
        fingerprint: Fingerprint,
        verdict: RiskVerdict,
        prompt_version: &str,
        source: AssessmentSource,
    ) -> Self {
        Self {
            unit,
            fingerprint,
            score: verdict.score,
            tags: verdict.tags,
            model: verdict.model,
            prompt_version: prompt_version.to_string(),
            source,
        }
    }

    /// Placeholder used when the backend never produced a usable answer.
    pub fn degraded(
        unit: UnitId,
        fingerprint: Fingerprint,
        default_score: f64,
        model: &str,
        prompt_version: &str,
    ) -> Self {
        Self {
            unit,
            fingerprint,
            score: default_score,
            tags: BTreeSet::from([UNKNOWN_TAG.to_string()]),
            model: model.to_string(),
            prompt_version: prompt_version.to_string(),
            source: AssessmentSource::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source == AssessmentSource::Degraded
    }

    /// Extract the cacheable part of this assessment.
    pub fn verdict(&self) -> RiskVerdict {
        RiskVerdict {
            score: self.score,
            tags: self.tags.clone(),
            model: self.model.clone(),
        }
    }
}
