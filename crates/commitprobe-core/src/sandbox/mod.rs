//! Sandbox: isolated execution of synthesized tests.
//!
//! The engine talks to a [`SandboxExecutor`]. [`ProcessSandbox`] runs real
//! child processes under a [`SandboxPolicy`]; [`TestRunner`] turns raw
//! execution results into verdicts, retries flaky ones and attributes
//! coverage to the unit under test.
//!
//! # Modules
//!
//! - [`policy`]: `SandboxPolicy`, env allow-list, command templates
//! - [`request`]: `ExecutionRequest` / `ExecutionResult`
//! - [`process`]: `ProcessSandbox` (tokio child processes)
//! - [`harness`]: bundled Python coverage harness
//! - [`runner`]: `TestRunner`, `TestJob`
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod error;
pub mod fakes;
pub mod harness;
pub mod policy;
pub mod process;
pub mod request;
pub mod runner;

use async_trait::async_trait;

pub use error::{SandboxError, SandboxResult};
pub use policy::{NetworkIsolation, SandboxPolicy};
pub use process::ProcessSandbox;
pub use request::{ExecutionRequest, ExecutionResult, SandboxFile};
pub use runner::{TestJob, TestRunner};

/// Runs one test in isolation.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> SandboxResult<ExecutionResult>;
}
