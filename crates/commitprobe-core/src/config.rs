//! Engine configuration bundle.
//!
//! Keys are camelCase so the bundle can be handed over by any transport
//! (TOML file, JSON request body) without renaming. Every field has a
//! default; [`EngineConfig::validate`] rejects values the engine cannot run
//! with, which is run-fatal.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{ProbeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Unit risk at or above which a test is synthesized.
    pub risk_threshold: f64,
    /// Retries after the first backend attempt (0 = single attempt).
    pub max_retries: u32,
    /// Upper bound on concurrent unit work within a state.
    pub concurrency_limit: usize,
    pub test_timeout_seconds: u64,
    pub prompt_version: String,
    /// LRU entry ceiling of the in-memory fingerprint cache.
    pub cache_capacity: usize,
    /// Score given to units whose assessment degraded.
    pub default_risk_score: f64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Base delay used when the backend signals throttling.
    pub rate_limit_backoff_ms: u64,
    /// Wall-clock bound on a single backend call.
    pub model_timeout_seconds: u64,
    /// Weight of additional high-risk units in a file's score.
    pub aggregation_weight: f64,
    /// Treat renames as modifications instead of delete + add.
    pub move_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 0.7,
            max_retries: 3,
            concurrency_limit: 4,
            test_timeout_seconds: 30,
            prompt_version: "v1".to_string(),
            cache_capacity: 1024,
            default_risk_score: 0.5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            rate_limit_backoff_ms: 2_000,
            model_timeout_seconds: 120,
            aggregation_weight: 0.5,
            move_detection: false,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML bundle. Missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| ProbeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the bundle as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProbeError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let unit_interval = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(ProbeError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
            Ok(())
        };
        unit_interval("riskThreshold", self.risk_threshold)?;
        unit_interval("defaultRiskScore", self.default_risk_score)?;
        unit_interval("aggregationWeight", self.aggregation_weight)?;

        if self.concurrency_limit == 0 {
            return Err(ProbeError::InvalidConfig(
                "concurrencyLimit must be at least 1".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ProbeError::InvalidConfig(
                "cacheCapacity must be at least 1".to_string(),
            ));
        }
        if self.test_timeout_seconds == 0 {
            return Err(ProbeError::InvalidConfig(
                "testTimeoutSeconds must be at least 1".to_string(),
            ));
        }
        if self.model_timeout_seconds == 0 {
            return Err(ProbeError::InvalidConfig(
                "modelTimeoutSeconds must be at least 1".to_string(),
            ));
        }
        if self.prompt_version.trim().is_empty() {
            return Err(ProbeError::InvalidConfig(
                "promptVersion must not be empty".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ProbeError::InvalidConfig(format!(
                "backoffMaxMs ({}) must not be below backoffBaseMs ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_seconds)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_seconds)
    }
}
