//! HTTP model backend.
//!
//! POSTs each request as JSON to a single completion endpoint and reads the
//! model text from the `content` field of the response (or the raw body when
//! the response is not JSON).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendError, ModelBackend, ModelRequest};

pub const ENDPOINT_ENV: &str = "COMMITPROBE_ENDPOINT";
pub const API_KEY_ENV: &str = "COMMITPROBE_API_KEY";
pub const MODEL_ENV: &str = "COMMITPROBE_MODEL";

const DEFAULT_MODEL: &str = "default";

/// Connection settings for [`HttpModelBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Per-request wall-clock bound.
    pub timeout_seconds: u64,
}

impl HttpBackendConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            timeout_seconds: 120,
        }
    }

    /// Read `COMMITPROBE_ENDPOINT`, `COMMITPROBE_API_KEY` and
    /// `COMMITPROBE_MODEL`. Returns `None` when no endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var(ENDPOINT_ENV).ok().filter(|v| !v.trim().is_empty())?;
        let model = std::env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let mut config = Self::new(endpoint, model);
        config.api_key = std::env::var(API_KEY_ENV).ok().filter(|v| !v.is_empty());
        Some(config)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs().max(1);
        self
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    purpose: &'a str,
    prompt_version: &'a str,
    unit: String,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

pub struct HttpModelBackend {
    config: HttpBackendConfig,
    http_client: reqwest::Client,
}

impl HttpModelBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("commitprobe/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }
}

/// `Retry-After` in seconds (HTTP-date values are ignored).
fn retry_after_ms(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

/// Model text from a response body.
fn content_of(body: String) -> String {
    match serde_json::from_str::<CompletionResponse>(&body) {
        Ok(parsed) => parsed.content,
        Err(_) => body,
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, BackendError> {
        let body = CompletionBody {
            model: &self.config.model,
            purpose: request.purpose.as_str(),
            prompt_version: &request.prompt_version,
            unit: request.unit.to_string(),
            prompt: &request.prompt,
        };

        let mut builder = self.http_client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        debug!(unit = %request.unit, status = status.as_u16(), "backend responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited {
                retry_after_ms: retry_after_ms(&response),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(200).collect();
            return Err(BackendError::Unavailable(format!("HTTP {status}: {detail}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to read body: {e}")))?;
        Ok(content_of(text))
    }
}
