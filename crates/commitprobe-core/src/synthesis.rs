//! Test synthesis for high-risk units.
//!
//! A unit qualifies when its score is at or above the configured threshold.
//! The model's reply is reduced to code, normalized and syntax-checked; one
//! re-prompt carrying the parse error is allowed. Accepted tests are cached
//! under the `test` namespace keyed by the unit fingerprint.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{request_synthesis, reply::extract_code, ModelBackend, ModelRequest};
use crate::backend::{RequestPurpose, SynthesisReply};
use crate::cache::{CacheError, CacheKey, CachedValue, FingerprintCache};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::domain::assessment::RiskAssessment;
use crate::domain::test_case::{SynthesizedTest, TestArtifact};
use crate::domain::unit::{CommitUnit, Fingerprint};
use crate::metrics::METRICS;
use crate::prompt;
use crate::retry::{execute_with_retry, RetryError, RetryKind, RetryPolicy, Retryable};
use crate::syntax::{check_syntax, Language, SyntaxCheck};

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("risk score {score} is below threshold {threshold}")]
    BelowThreshold { score: f64, threshold: f64 },

    #[error("unit was removed by the commit; nothing to test")]
    RemovedUnit,

    #[error("model declined to write a test: {reason}")]
    SynthesisRejected { reason: String },

    #[error("no usable test code after {attempts} attempts: {reason}")]
    SynthesisUnparseable { attempts: u32, reason: String },

    #[error("model unavailable after {attempts} attempts: {reason}")]
    ModelUnavailable { attempts: u32, reason: String },

    #[error("model rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error(transparent)]
    CacheConflict(#[from] CacheError),

    #[error("synthesis cancelled")]
    Cancelled,
}

impl SynthesisError {
    /// Stable short name recorded on the unit.
    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisError::BelowThreshold { .. } => "below_threshold",
            SynthesisError::RemovedUnit => "removed_unit",
            SynthesisError::SynthesisRejected { .. } => "synthesis_rejected",
            SynthesisError::SynthesisUnparseable { .. } => "synthesis_unparseable",
            SynthesisError::ModelUnavailable { .. } => "model_unavailable",
            SynthesisError::RateLimited { .. } => "rate_limited",
            SynthesisError::CacheConflict(_) => "cache_conflict",
            SynthesisError::Cancelled => "cancelled",
        }
    }

    /// Failures recorded on the unit rather than aborting the run.
    pub fn is_unit_level(&self) -> bool {
        !matches!(
            self,
            SynthesisError::CacheConflict(_) | SynthesisError::Cancelled
        )
    }

    fn from_retry(err: RetryError, prior_attempts: u32) -> Self {
        match err {
            RetryError::Cancelled { .. } => SynthesisError::Cancelled,
            RetryError::Exhausted { attempts, last } => {
                let attempts = attempts + prior_attempts;
                match last.kind {
                    RetryKind::Invalid => SynthesisError::SynthesisUnparseable {
                        attempts,
                        reason: last.reason,
                    },
                    RetryKind::RateLimited { .. } => SynthesisError::RateLimited { attempts },
                    RetryKind::Transient => SynthesisError::ModelUnavailable {
                        attempts,
                        reason: last.reason,
                    },
                }
            }
        }
    }
}

/// What one prompt round produced.
enum Draft {
    Code(String),
    Declined(String),
}

/// Identity of a unit's test: its content fingerprint placed at its path.
pub fn test_fingerprint(unit: &CommitUnit) -> Fingerprint {
    unit.fingerprint.placed_at(&unit.id.path)
}

/// Deterministic test file name: `test_<symbol>_<fp8>.<ext>`, where `fp8`
/// comes from [`test_fingerprint`].
///
/// Go tests additionally end in `_test.go` so `go test` picks them up.
pub fn test_file_name(unit: &CommitUnit) -> String {
    let symbol = sanitize_symbol(&unit.id.symbol);
    let fingerprint = test_fingerprint(unit);
    let fp8 = fingerprint.prefix(8);
    match unit.language {
        Some(Language::Go) => format!("test_{symbol}_{fp8}_test.go"),
        Some(language) => format!("test_{symbol}_{fp8}.{}", language.extension()),
        None => {
            let ext = unit
                .id
                .path
                .rsplit_once('.')
                .map(|(_, ext)| ext)
                .filter(|ext| !ext.is_empty() && !ext.contains('/'))
                .unwrap_or("txt");
            format!("test_{symbol}_{fp8}.{ext}")
        }
    }
}

fn sanitize_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for c in symbol.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unit".to_string()
    } else {
        trimmed.to_string()
    }
}

/// CRLF to LF, trailing whitespace trimmed, exactly one trailing newline.
pub fn normalize_source(code: &str) -> String {
    let unified = code.replace("\r\n", "\n");
    let mut out = unified
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let kept = out.trim_end_matches('\n').len();
    out.truncate(kept);
    out.push('\n');
    out
}

pub struct TestSynthesizer {
    backend: Arc<dyn ModelBackend>,
    cache: Arc<FingerprintCache>,
    policy: RetryPolicy,
    prompt_version: String,
    threshold: f64,
}

impl TestSynthesizer {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        cache: Arc<FingerprintCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            policy: RetryPolicy::from_config(config),
            prompt_version: config.prompt_version.clone(),
            threshold: config.risk_threshold,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether `assessment` qualifies for a synthesized test.
    pub fn qualifies(&self, assessment: &RiskAssessment) -> bool {
        assessment.score >= self.threshold
    }

    async fn cached_artifact(&self, key: &CacheKey) -> Option<TestArtifact> {
        match self.cache.lookup(key).await {
            Ok(Some(CachedValue::Test(artifact))) => Some(artifact),
            Ok(Some(CachedValue::Risk(_))) => {
                warn!(key = %key, "risk verdict found under a test key; ignoring");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cache lookup failed; treating as miss");
                None
            }
        }
    }

    pub async fn synthesize(
        &self,
        unit: &CommitUnit,
        assessment: &RiskAssessment,
        cancel: &CancelToken,
    ) -> Result<SynthesizedTest, SynthesisError> {
        if !self.qualifies(assessment) {
            return Err(SynthesisError::BelowThreshold {
                score: assessment.score,
                threshold: self.threshold,
            });
        }
        if unit.is_removed() {
            return Err(SynthesisError::RemovedUnit);
        }

        let key = CacheKey::test(&test_fingerprint(unit), &self.prompt_version);
        if let Some(artifact) = self.cached_artifact(&key).await {
            METRICS.inc_cache_hits();
            return Ok(SynthesizedTest::from_artifact(
                unit.id.clone(),
                artifact,
                assessment.score,
                0,
                true,
            ));
        }

        let _flight = self.cache.single_flight(&key).await;
        if let Some(artifact) = self.cached_artifact(&key).await {
            METRICS.inc_cache_hits();
            return Ok(SynthesizedTest::from_artifact(
                unit.id.clone(),
                artifact,
                assessment.score,
                0,
                true,
            ));
        }

        let file_name = test_file_name(unit);
        let (source, attempts) = self.draft_valid(unit, assessment, &file_name, cancel).await?;

        let artifact = TestArtifact {
            file_name,
            language: unit.language,
            source,
        };
        match self.cache.store(&key, CachedValue::Test(artifact.clone())).await {
            Ok(_) => {}
            Err(err @ CacheError::Conflict { .. }) => return Err(SynthesisError::CacheConflict(err)),
            Err(err) => warn!(key = %key, error = %err, "failed to persist synthesized test"),
        }

        info!(unit = %unit.id, file = %artifact.file_name, attempts, "test synthesized");
        Ok(SynthesizedTest::from_artifact(
            unit.id.clone(),
            artifact,
            assessment.score,
            attempts,
            false,
        ))
    }

    /// Prompt, then re-prompt once if the code does not parse.
    async fn draft_valid(
        &self,
        unit: &CommitUnit,
        assessment: &RiskAssessment,
        file_name: &str,
        cancel: &CancelToken,
    ) -> Result<(String, u32), SynthesisError> {
        let first = prompt::synthesis_prompt(unit, assessment, &self.prompt_version, file_name, None);
        let (code, attempts) = self.draft(unit, first, cancel, 0).await?;

        let Some(error) = syntax_error(unit.language, &code) else {
            return Ok((code, attempts));
        };
        debug!(unit = %unit.id, error = %error, "generated test does not parse; re-prompting");

        let retry = prompt::synthesis_prompt(
            unit,
            assessment,
            &self.prompt_version,
            file_name,
            Some(&error),
        );
        let (code, more) = self.draft(unit, retry, cancel, attempts).await?;
        let attempts = attempts + more;
        match syntax_error(unit.language, &code) {
            None => Ok((code, attempts)),
            Some(error) => Err(SynthesisError::SynthesisUnparseable {
                attempts,
                reason: format!("syntax error after re-prompt: {error}"),
            }),
        }
    }

    /// One prompt round under the retry policy. Returns normalized code.
    async fn draft(
        &self,
        unit: &CommitUnit,
        prompt: String,
        cancel: &CancelToken,
        prior_attempts: u32,
    ) -> Result<(String, u32), SynthesisError> {
        if cancel.is_cancelled() {
            return Err(SynthesisError::Cancelled);
        }
        let request = ModelRequest {
            purpose: RequestPurpose::Synthesis,
            unit: unit.id.clone(),
            prompt_version: self.prompt_version.clone(),
            prompt,
        };
        let label = format!("synthesis {}", unit.id);
        let backend = self.backend.as_ref();

        let outcome = execute_with_retry(&self.policy, cancel, &label, |_attempt| {
            let request = &request;
            async move {
                METRICS.inc_model_calls();
                match request_synthesis(backend, request).await {
                    SynthesisReply::Source(text) => match extract_code(&text) {
                        Some(code) => Ok(Draft::Code(normalize_source(&code))),
                        None => Err(Retryable::new(
                            RetryKind::Invalid,
                            "reply contains no recognizable code",
                        )),
                    },
                    SynthesisReply::Declined(reason) => Ok(Draft::Declined(reason)),
                    SynthesisReply::RateLimited { retry_after_ms } => Err(Retryable::new(
                        RetryKind::RateLimited { retry_after_ms },
                        "rate limited",
                    )),
                    SynthesisReply::Unavailable(reason) => {
                        Err(Retryable::new(RetryKind::Transient, reason))
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok((Draft::Code(code), attempts)) => Ok((code, attempts)),
            Ok((Draft::Declined(reason), _)) => Err(SynthesisError::SynthesisRejected { reason }),
            Err(err) => Err(SynthesisError::from_retry(err, prior_attempts)),
        }
    }
}

fn syntax_error(language: Option<Language>, code: &str) -> Option<String> {
    let language = language?;
    match check_syntax(language, code) {
        SyntaxCheck::Valid | SyntaxCheck::Unsupported => None,
        SyntaxCheck::Invalid {
            line,
            column,
            detail,
        } => Some(format!("line {line}, column {column}: {detail}")),
    }
}
