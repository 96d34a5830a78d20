//! Risk aggregation.
//!
//! Pure and deterministic. Per file:
//!
//! ```text
//! score = max + (1 - max) * weight * extra_high / unit_count
//! ```
//!
//! where `max` is the highest unit score in the file and `extra_high` the
//! number of units at or above the high-risk cutoff beyond the first. The
//! commit score is the highest file score (0.0 when nothing was scored).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domain::assessment::RiskAssessment;
use crate::domain::test_case::{TestOutcome, TestVerdict};
use crate::domain::unit::{CommitUnit, Fingerprint, UnitId};

/// Residual risk floor after a synthesized test fails.
pub const FAILED_TEST_FLOOR: f64 = 0.9;
/// Share of a unit's risk a fully covering passing test removes.
pub const PASS_REDUCTION: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRisk {
    pub path: String,
    pub score: f64,
    pub max_unit_score: f64,
    /// Units at or above the high-risk cutoff.
    pub high_risk_units: usize,
    pub unit_count: usize,
    /// Highest-scoring unit (earliest in the file on ties).
    pub top_unit: Option<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRisk {
    pub commit_score: f64,
    /// Sorted by path.
    pub files: Vec<FileRisk>,
}

impl AggregatedRisk {
    pub fn file(&self, path: &str) -> Option<&FileRisk> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Aggregate unit assessments into file and commit scores.
///
/// Units without an assessment (skipped by cancellation) do not count.
pub fn aggregate(
    units: &[CommitUnit],
    assessments: &[RiskAssessment],
    config: &EngineConfig,
) -> AggregatedRisk {
    let scores: HashMap<&UnitId, f64> = assessments.iter().map(|a| (&a.unit, a.score)).collect();
    aggregate_scores(units, |id| scores.get(id).copied(), config)
}

/// Aggregate residual risk: assessments adjusted by test outcomes.
pub fn aggregate_residual(
    units: &[CommitUnit],
    assessments: &[RiskAssessment],
    outcomes: &[TestOutcome],
    config: &EngineConfig,
) -> AggregatedRisk {
    let by_unit: HashMap<&UnitId, &TestOutcome> = outcomes.iter().map(|o| (&o.unit, o)).collect();
    let scores: HashMap<&UnitId, f64> = assessments
        .iter()
        .map(|a| (&a.unit, residual_risk(a, by_unit.get(&a.unit).copied())))
        .collect();
    aggregate_scores(units, |id| scores.get(id).copied(), config)
}

/// Unit risk after feeding back a test outcome.
///
/// Pass: reduced by `score * 0.5 * coverage_ratio` (no coverage data means
/// no reduction). Fail: raised to at least 0.9. Error, timeout or no test:
/// unchanged.
pub fn residual_risk(assessment: &RiskAssessment, outcome: Option<&TestOutcome>) -> f64 {
    let score = assessment.score;
    let Some(outcome) = outcome else {
        return score;
    };
    let residual = match outcome.verdict {
        TestVerdict::Pass => {
            let ratio = outcome.coverage.map(|c| c.ratio()).unwrap_or(0.0);
            score - score * PASS_REDUCTION * ratio
        }
        TestVerdict::Fail => score.max(FAILED_TEST_FLOOR),
        TestVerdict::Error | TestVerdict::Timeout => score,
    };
    residual.clamp(0.0, 1.0)
}

fn file_order(a: &CommitUnit, b: &CommitUnit) -> std::cmp::Ordering {
    a.id.start_line
        .cmp(&b.id.start_line)
        .then(a.id.end_line.cmp(&b.id.end_line))
        .then_with(|| a.id.symbol.cmp(&b.id.symbol))
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
}

fn aggregate_scores(
    units: &[CommitUnit],
    score_of: impl Fn(&UnitId) -> Option<f64>,
    config: &EngineConfig,
) -> AggregatedRisk {
    let cutoff = config.risk_threshold;
    let weight = config.aggregation_weight;

    let mut by_file: BTreeMap<&str, Vec<(&CommitUnit, f64)>> = BTreeMap::new();
    for unit in units {
        if let Some(score) = score_of(&unit.id) {
            by_file
                .entry(unit.id.path.as_str())
                .or_default()
                .push((unit, score));
        }
    }

    let mut files = Vec::with_capacity(by_file.len());
    for (path, mut entries) in by_file {
        entries.sort_by(|(a, _), (b, _)| file_order(a, b));

        // Identical fingerprints collapse; the later unit in file order wins.
        let mut slots: Vec<(&CommitUnit, f64)> = Vec::with_capacity(entries.len());
        let mut index: HashMap<&Fingerprint, usize> = HashMap::new();
        for (unit, score) in entries {
            match index.get(&unit.fingerprint) {
                Some(&i) => slots[i] = (unit, score),
                None => {
                    index.insert(&unit.fingerprint, slots.len());
                    slots.push((unit, score));
                }
            }
        }

        let unit_count = slots.len();
        let mut max = 0.0_f64;
        let mut top: Option<&CommitUnit> = None;
        for (unit, score) in &slots {
            if top.is_none() || *score > max {
                max = *score;
                top = Some(unit);
            }
        }
        let high = slots.iter().filter(|(_, s)| *s >= cutoff).count();
        let extra_high = high.saturating_sub(1);

        let score = if unit_count == 0 {
            0.0
        } else {
            (max + (1.0 - max) * weight * extra_high as f64 / unit_count as f64).clamp(0.0, 1.0)
        };

        files.push(FileRisk {
            path: path.to_string(),
            score,
            max_unit_score: max,
            high_risk_units: high,
            unit_count,
            top_unit: top.map(|u| u.id.clone()),
        });
    }

    let commit_score = files.iter().map(|f| f.score).fold(0.0_f64, f64::max);
    AggregatedRisk {
        commit_score,
        files,
    }
}
