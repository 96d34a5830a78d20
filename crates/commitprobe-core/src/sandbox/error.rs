//! Error types for the sandbox module.

/// Errors produced by the sandbox layer.
///
/// These are infrastructure failures; a test that runs and fails is a
/// verdict, not an error.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare sandbox workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("refusing to write outside the sandbox: {path}")]
    UnsafePath { path: String },

    #[error("no command configured for {language} tests")]
    NoCommand { language: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
