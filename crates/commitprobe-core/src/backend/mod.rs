//! Model backend seam.
//!
//! The engine only ever talks to a [`ModelBackend`]: a raw text-completion
//! call. Loosely-typed reply text is validated into tagged variants
//! ([`RiskReply`], [`SynthesisReply`]) right at this boundary so the rest of
//! the engine never handles raw model output.

pub mod fakes;
pub mod http;
pub mod reply;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::unit::UnitId;

pub use http::{HttpBackendConfig, HttpModelBackend};
pub use reply::{RiskReply, SynthesisReply};

/// What a request asks the model to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Risk,
    Synthesis,
}

impl RequestPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPurpose::Risk => "risk",
            RequestPurpose::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub purpose: RequestPurpose,
    pub unit: UnitId,
    pub prompt_version: String,
    /// Fully rendered prompt (body, diff and context).
    pub prompt: String,
}

/// Transport-level failures. Both kinds are transient and retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend rate limited the request")]
    RateLimited {
        /// Backend-provided hint, if any.
        retry_after_ms: Option<u64>,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// A text-completion model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifier recorded on every assessment.
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<String, BackendError>;
}

/// Issue a risk request and classify the reply.
pub async fn request_risk(backend: &dyn ModelBackend, request: &ModelRequest) -> RiskReply {
    RiskReply::classify(backend.complete(request).await)
}

/// Issue a synthesis request and classify the reply.
pub async fn request_synthesis(backend: &dyn ModelBackend, request: &ModelRequest) -> SynthesisReply {
    SynthesisReply::classify(backend.complete(request).await)
}
