//! Risk inference client.
//!
//! Scores one unit at a time: fingerprint cache first, then the model
//! backend under the shared retry policy. Successful verdicts are cached;
//! degraded ones never are.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{request_risk, ModelBackend, ModelRequest, RequestPurpose, RiskReply};
use crate::cache::{CacheError, CacheKey, CachedValue, FingerprintCache};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::domain::assessment::{AssessmentSource, RiskAssessment, RiskVerdict};
use crate::domain::unit::CommitUnit;
use crate::metrics::METRICS;
use crate::obs;
use crate::prompt;
use crate::retry::{execute_with_retry, RetryError, RetryKind, RetryPolicy, Retryable};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model unavailable after {attempts} attempts: {reason}")]
    ModelUnavailable { attempts: u32, reason: String },

    #[error("model response invalid after {attempts} attempts: {reason}")]
    ModelResponseInvalid { attempts: u32, reason: String },

    #[error("model rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error(transparent)]
    CacheConflict(#[from] CacheError),

    #[error("inference cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Failures that degrade the unit instead of failing the run.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            InferenceError::ModelUnavailable { .. }
                | InferenceError::ModelResponseInvalid { .. }
                | InferenceError::RateLimited { .. }
        )
    }
}

impl From<RetryError> for InferenceError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Cancelled { .. } => InferenceError::Cancelled,
            RetryError::Exhausted { attempts, last } => match last.kind {
                RetryKind::Invalid => InferenceError::ModelResponseInvalid {
                    attempts,
                    reason: last.reason,
                },
                RetryKind::RateLimited { .. } => InferenceError::RateLimited { attempts },
                RetryKind::Transient => InferenceError::ModelUnavailable {
                    attempts,
                    reason: last.reason,
                },
            },
        }
    }
}

pub struct RiskInferenceClient {
    backend: Arc<dyn ModelBackend>,
    cache: Arc<FingerprintCache>,
    policy: RetryPolicy,
    prompt_version: String,
    default_score: f64,
}

impl RiskInferenceClient {
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
            default_score: config.default_risk_score,
        }
    }

    /// Override the retry policy (tests use this to disable jitter).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn cached_verdict(&self, key: &CacheKey) -> Option<RiskVerdict> {
        match self.cache.lookup(key).await {
            Ok(Some(CachedValue::Risk(verdict))) => Some(verdict),
            Ok(Some(CachedValue::Test(_))) => {
                warn!(key = %key, "test artifact found under a risk key; ignoring");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cache lookup failed; treating as miss");
                None
            }
        }
    }

    /// Score `unit`, consulting the cache first.
    pub async fn assess(
        &self,
        unit: &CommitUnit,
        cancel: &CancelToken,
    ) -> Result<RiskAssessment, InferenceError> {
        let key = CacheKey::risk(&unit.fingerprint, &self.prompt_version);

        if let Some(verdict) = self.cached_verdict(&key).await {
            METRICS.inc_cache_hits();
            return Ok(self.bind(unit, verdict, AssessmentSource::Cache));
        }

        let _flight = self.cache.single_flight(&key).await;
        // Another task may have filled the entry while we waited.
        if let Some(verdict) = self.cached_verdict(&key).await {
            METRICS.inc_cache_hits();
            return Ok(self.bind(unit, verdict, AssessmentSource::Cache));
        }

        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        let request = ModelRequest {
            purpose: RequestPurpose::Risk,
            unit: unit.id.clone(),
            prompt_version: self.prompt_version.clone(),
            prompt: prompt::risk_prompt(unit, &self.prompt_version),
        };
        let label = unit.id.to_string();
        let backend = self.backend.as_ref();
        let model = backend.model_id().to_string();

        let (verdict, attempts) = execute_with_retry(&self.policy, cancel, &label, |_attempt| {
            let request = &request;
            let model = &model;
            async move {
                METRICS.inc_model_calls();
                match request_risk(backend, request).await {
                    RiskReply::Score { score, tags } => Ok(RiskVerdict {
                        score,
                        tags,
                        model: model.clone(),
                    }),
                    RiskReply::ParseError(reason) => Err(Retryable::new(RetryKind::Invalid, reason)),
                    RiskReply::RateLimited { retry_after_ms } => Err(Retryable::new(
                        RetryKind::RateLimited { retry_after_ms },
                        "rate limited",
                    )),
                    RiskReply::Unavailable(reason) => {
                        Err(Retryable::new(RetryKind::Transient, reason))
                    }
                }
            }
        })
        .await?;

        debug!(unit = %unit.id, attempts, score = verdict.score, "unit assessed");

        match self.cache.store(&key, CachedValue::Risk(verdict.clone())).await {
            Ok(_) => {}
            Err(err @ CacheError::Conflict { .. }) => return Err(InferenceError::CacheConflict(err)),
            Err(err) => warn!(key = %key, error = %err, "failed to persist risk verdict"),
        }

        Ok(self.bind(unit, verdict, AssessmentSource::Model))
    }

    /// Like [`assess`](Self::assess), but unit-level failures become a
    /// degraded assessment with the default score and the `unknown` tag.
    /// Only cache conflicts and cancellation are returned as errors.
    pub async fn assess_or_degrade(
        &self,
        unit: &CommitUnit,
        cancel: &CancelToken,
    ) -> Result<RiskAssessment, InferenceError> {
        match self.assess(unit, cancel).await {
            Ok(assessment) => Ok(assessment),
            Err(err) if err.is_degradable() => {
                obs::emit_unit_degraded(&unit.id.to_string(), &err);
                METRICS.inc_units_degraded();
                Ok(RiskAssessment::degraded(
                    unit.id.clone(),
                    unit.fingerprint.clone(),
                    self.default_score,
                    self.backend.model_id(),
                    &self.prompt_version,
                ))
            }
            Err(err) => Err(err),
        }
    }

    fn bind(&self, unit: &CommitUnit, verdict: RiskVerdict, source: AssessmentSource) -> RiskAssessment {
        RiskAssessment::from_verdict(
            unit.id.clone(),
            unit.fingerprint.clone(),
            verdict,
            &self.prompt_version,
            source,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::ScriptedBackend;
    use crate::backend::BackendError;
    use crate::domain::assessment::UNKNOWN_TAG;
    use crate::domain::unit::{Fingerprint, UnitId, UnitKind};

    fn unit(symbol: &str, body: &str) -> CommitUnit {
        CommitUnit {
            id: UnitId::new("a.py", symbol, 1, 2),
            kind: UnitKind::Function,
            language: None,
            diff: String::new(),
            pre_body: None,
            post_body: Some(body.to_string()),
            signature: None,
            context_signatures: Vec::new(),
            fingerprint: Fingerprint::of_unit(UnitKind::Function, symbol, None, Some(body)),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            rate_limit_backoff_ms: 1,
            attempt_timeout_ms: 5_000,
            jitter: false,
        }
    }

    fn client(backend: Arc<ScriptedBackend>, max_retries: u32) -> RiskInferenceClient {
        RiskInferenceClient::new(
            backend,
            Arc::new(FingerprintCache::new(16)),
            &EngineConfig::default(),
        )
        .with_policy(fast_policy(max_retries))
    }

    #[tokio::test]
    async fn test_second_assessment_hits_cache() {
        let backend = Arc::new(ScriptedBackend::new("m"));
        backend.push_risk_text(r#"{"score": 0.6, "tags": ["io"]}"#);
        let client = client(backend.clone(), 3);
        let u = unit("f", "def f(): pass");

        let first = client.assess(&u, &CancelToken::new()).await.unwrap();
        let second = client.assess(&u, &CancelToken::new()).await.unwrap();

        assert_eq!(first.source, AssessmentSource::Model);
        assert_eq!(second.source, AssessmentSource::Cache);
        assert_eq!(first.score, second.score);
        assert_eq!(backend.calls(RequestPurpose::Risk), 1);
    }

    #[tokio::test]
    async fn test_malformed_replies_are_retried() {
        let backend = Arc::new(ScriptedBackend::new("m"));
        backend
            .push_risk_text("not json")
            .push_risk(Err(BackendError::RateLimited {
                retry_after_ms: Some(1),
            }))
            .push_risk_text(r#"{"score": 0.2}"#);
        let client = client(backend.clone(), 3);

        let a = client
            .assess(&unit("f", "x"), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(a.score, 0.2);
        assert_eq!(backend.calls(RequestPurpose::Risk), 3);
    }

    #[tokio::test]
    async fn test_exhausted_invalid_degrades() {
        let backend = Arc::new(
            ScriptedBackend::new("m").with_responder(|_| Ok("definitely not json".to_string())),
        );
        let client = client(backend.clone(), 2);
        let u = unit("f", "x");

        let err = client.assess(&u, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ModelResponseInvalid { attempts: 3, .. }
        ));

        let degraded = client.assess_or_degrade(&u, &CancelToken::new()).await.unwrap();
        assert!(degraded.is_degraded());
        assert!(degraded.tags.contains(UNKNOWN_TAG));
        assert_eq!(degraded.score, 0.5);
        // 3 attempts for each call; nothing was cached.
        assert_eq!(backend.calls(RequestPurpose::Risk), 6);
    }

    #[tokio::test]
    async fn test_unavailable_maps_to_model_unavailable() {
        let backend = Arc::new(ScriptedBackend::new("m"));
        let client = client(backend, 0);
        let err = client
            .assess(&unit("f", "x"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ModelUnavailable { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_client_issues_no_call() {
        let backend = Arc::new(ScriptedBackend::new("m"));
        let client = client(backend.clone(), 3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = client
            .assess_or_degrade(&unit("f", "x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Cancelled));
        assert_eq!(backend.calls(RequestPurpose::Risk), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_fingerprint_single_call() {
        let backend = Arc::new(
            ScriptedBackend::new("m")
                .with_latency(std::time::Duration::from_millis(20))
                .with_responder(|_| Ok(r#"{"score": 0.4}"#.to_string())),
        );
        let client = Arc::new(client(backend.clone(), 0));
        let u = unit("f", "same body");

        let (cancel_a, cancel_b) = (CancelToken::new(), CancelToken::new());
        let (a, b) = tokio::join!(
            client.assess(&u, &cancel_a),
            client.assess(&u, &cancel_b)
        );
        assert_eq!(a.unwrap().score, 0.4);
        assert_eq!(b.unwrap().score, 0.4);
        assert_eq!(backend.calls(RequestPurpose::Risk), 1);
    }
}
