//! Scripted model backend for tests.
//!
//! Replies come from per-purpose queues first, then from an optional
//! responder closure (useful when concurrent requests arrive in an
//! unpredictable order), and finally fall back to `Unavailable`.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendError, ModelBackend, ModelRequest, RequestPurpose};

type Responder = Box<dyn Fn(&ModelRequest) -> Result<String, BackendError> + Send + Sync>;

pub struct ScriptedBackend {
    model: String,
    risk: Mutex<VecDeque<Result<String, BackendError>>>,
    synthesis: Mutex<VecDeque<Result<String, BackendError>>>,
    responder: Option<Responder>,
    latency: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            risk: Mutex::new(VecDeque::new()),
            synthesis: Mutex::new(VecDeque::new()),
            responder: None,
            latency: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the next risk request.
    pub fn push_risk(&self, reply: Result<String, BackendError>) -> &Self {
        lock(&self.risk).push_back(reply);
        self
    }

    pub fn push_risk_text(&self, text: impl Into<String>) -> &Self {
        self.push_risk(Ok(text.into()))
    }

    /// Queue a reply for the next synthesis request.
    pub fn push_synthesis(&self, reply: Result<String, BackendError>) -> &Self {
        lock(&self.synthesis).push_back(reply);
        self
    }

    pub fn push_synthesis_text(&self, text: impl Into<String>) -> &Self {
        self.push_synthesis(Ok(text.into()))
    }

    /// Answer requests the queues do not cover.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&ModelRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Sleep this long before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of requests received for `purpose`.
    pub fn calls(&self, purpose: RequestPurpose) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String, BackendError> {
        lock(&self.requests).push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = match request.purpose {
            RequestPurpose::Risk => lock(&self.risk).pop_front(),
            RequestPurpose::Synthesis => lock(&self.synthesis).pop_front(),
        };
        if let Some(reply) = queued {
            return reply;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(BackendError::Unavailable(format!(
                "no scripted {} reply",
                request.purpose.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::unit::UnitId;

    fn request(purpose: RequestPurpose) -> ModelRequest {
        ModelRequest {
            purpose,
            unit: UnitId::new("a.py", "f", 1, 2),
            prompt_version: "v1".to_string(),
            prompt: String::new(),
        }
    }

    #[tokio::test]
    async fn test_queue_then_responder_then_unavailable() {
        let backend = ScriptedBackend::new("fake").with_responder(|r| {
            if r.purpose == RequestPurpose::Risk {
                Ok("{\"score\": 0.1}".to_string())
            } else {
                Err(BackendError::Unavailable("nope".to_string()))
            }
        });
        backend.push_risk_text("first");

        assert_eq!(backend.complete(&request(RequestPurpose::Risk)).await.unwrap(), "first");
        assert_eq!(
            backend.complete(&request(RequestPurpose::Risk)).await.unwrap(),
            "{\"score\": 0.1}"
        );
        assert!(backend
            .complete(&request(RequestPurpose::Synthesis))
            .await
            .is_err());
        assert_eq!(backend.calls(RequestPurpose::Risk), 2);
        assert_eq!(backend.calls(RequestPurpose::Synthesis), 1);
    }
}
