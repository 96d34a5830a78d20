//! Retry with exponential backoff, jitter and cancellation.
//!
//! Shared by risk inference and test synthesis. Attempt `n` (1-based) that
//! fails transiently waits `base * 2^(n-1)` (capped, with jitter) before the
//! next one; throttled attempts use the longer rate-limit base or the
//! backend's own hint, both bounded by the larger of the two ceilings.
//! Cancellation is honoured before every attempt and while waiting, never
//! in the middle of an attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rate_limit_backoff_ms: u64,
    /// Wall-clock bound on a single attempt.
    pub attempt_timeout_ms: u64,
    /// Spread delays randomly over `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
            rate_limit_backoff_ms: config.rate_limit_backoff_ms,
            attempt_timeout_ms: config.model_timeout_seconds.saturating_mul(1000),
            jitter: true,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32, kind: &RetryKind) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let throttle_ceiling = self.backoff_max_ms.max(self.rate_limit_backoff_ms);
        let ms = match kind {
            // A server hint is honoured as-is up to the ceiling; no jitter.
            RetryKind::RateLimited {
                retry_after_ms: Some(hint),
            } => return Duration::from_millis((*hint).min(throttle_ceiling)),
            RetryKind::RateLimited { retry_after_ms: None } => self
                .rate_limit_backoff_ms
                .saturating_mul(exp)
                .min(throttle_ceiling),
            RetryKind::Transient | RetryKind::Invalid => {
                self.backoff_base_ms.saturating_mul(exp).min(self.backoff_max_ms)
            }
        };
        if self.jitter && ms > 1 {
            let half = ms / 2;
            Duration::from_millis(half + rand::thread_rng().gen_range(0..=ms - half))
        } else {
            Duration::from_millis(ms)
        }
    }
}

/// Why an attempt should be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryKind {
    /// Network fault, backend outage or attempt timeout.
    Transient,
    RateLimited { retry_after_ms: Option<u64> },
    /// The backend answered with something unusable.
    Invalid,
}

impl RetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryKind::Transient => "transient",
            RetryKind::RateLimited { .. } => "rate_limited",
            RetryKind::Invalid => "invalid",
        }
    }
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retryable {
    pub kind: RetryKind,
    pub reason: String,
}

impl Retryable {
    pub fn new(kind: RetryKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {}", last.reason)]
    Exhausted { attempts: u32, last: Retryable },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Run `attempt_fn` until it succeeds, attempts run out, or `cancel` fires.
///
/// Returns the value together with the number of attempts made.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut attempt_fn: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Retryable>>,
{
    let max_attempts = policy.max_attempts();
    let timeout = Duration::from_millis(policy.attempt_timeout_ms.max(1));
    let mut last = Retryable::new(RetryKind::Transient, "no attempt made");

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        debug!(target: "commitprobe::retry", label, attempt, max_attempts, "attempt");
        let failure = match tokio::time::timeout(timeout, attempt_fn(attempt)).await {
            Ok(Ok(value)) => return Ok((value, attempt)),
            Ok(Err(failure)) => failure,
            Err(_elapsed) => Retryable::new(
                RetryKind::Transient,
                format!("attempt timed out after {}ms", timeout.as_millis()),
            ),
        };

        warn!(
            target: "commitprobe::retry",
            label,
            attempt,
            max_attempts,
            kind = failure.kind.as_str(),
            reason = %failure.reason,
            "attempt failed"
        );

        if attempt < max_attempts {
            let delay = policy.delay_after(attempt, &failure.kind);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
            }
        }
        last = failure;
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last,
    })
}
