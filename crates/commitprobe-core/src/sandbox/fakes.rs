//! Scripted sandbox executor for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::error::{SandboxError, SandboxResult};
use super::request::{ExecutionRequest, ExecutionResult};
use super::SandboxExecutor;

type Responder = Box<dyn Fn(&ExecutionRequest) -> ExecutionResult + Send + Sync>;

enum Scripted {
    Result(ExecutionResult),
    Error(String),
}

/// Replays queued results, then asks the responder, then passes.
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<Scripted>>,
    responder: Option<Responder>,
    latency: Option<Duration>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            latency: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: ExecutionResult) -> &Self {
        lock(&self.queue).push_back(Scripted::Result(result));
        self
    }

    /// Queue an infrastructure failure (reported as a spawn error).
    pub fn push_error(&self, reason: impl Into<String>) -> &Self {
        lock(&self.queue).push_back(Scripted::Error(reason.into()));
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&ExecutionRequest) -> ExecutionResult + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Sleep this long inside every execution.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl SandboxExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> SandboxResult<ExecutionResult> {
        lock(&self.requests).push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let queued = lock(&self.queue).pop_front();
        match queued {
            Some(Scripted::Result(result)) => Ok(result),
            Some(Scripted::Error(reason)) => Err(SandboxError::Spawn {
                program: "scripted".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, reason),
            }),
            None => Ok(match &self.responder {
                Some(responder) => responder(request),
                None => ExecutionResult::exited(0),
            }),
        }
    }
}
