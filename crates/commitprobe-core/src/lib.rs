//! commitprobe core library
//!
//! Splits a commit into units, scores each unit's defect risk with a model
//! backend, synthesizes tests for the risky ones and runs them in a sandbox.
//! [`Orchestrator`] drives the whole pipeline; every external collaborator
//! (model backend, cache store, sandbox executor) is injected.

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod extract;
pub mod inference;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod retry;
pub mod sandbox;
pub mod syntax;
pub mod synthesis;
pub mod telemetry;

pub use aggregate::{aggregate, aggregate_residual, residual_risk, AggregatedRisk, FileRisk};
pub use backend::{
    BackendError, HttpBackendConfig, HttpModelBackend, ModelBackend, ModelRequest,
    RequestPurpose, RiskReply, SynthesisReply,
};
pub use cache::{
    CacheError, CacheKey, CacheNamespace, CacheStats, CacheStore, CachedValue, FingerprintCache,
    FsCacheStore, MemoryCacheStore,
};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use domain::{
    AssessmentSource, CommitUnit, CoverageDelta, Fingerprint, PipelineRun, ProbeError, Result,
    RiskAssessment, RiskVerdict, RunFailure, RunState, SynthesisFailure, SynthesizedTest,
    TestOutcome, TestVerdict, UnitId, UnitKind, UNKNOWN_TAG,
};
pub use extract::{extract, CommitInput, ExtractError, Extraction};
pub use inference::{InferenceError, RiskInferenceClient};
pub use metrics::METRICS;
pub use obs::RunSpan;
pub use orchestrator::Orchestrator;
pub use report::{render_markdown, write_markdown, write_report_json, RunReport, UnitStatus};
pub use retry::RetryPolicy;
pub use sandbox::{ProcessSandbox, SandboxError, SandboxExecutor, SandboxPolicy, TestRunner};
pub use syntax::Language;
pub use synthesis::{SynthesisError, TestSynthesizer};
pub use telemetry::init_tracing;

/// commitprobe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
