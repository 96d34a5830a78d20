//! Run-level error taxonomy for commitprobe.
//!
//! Only errors that abort a whole pipeline run live here. Unit-level failures
//! (unparseable model output, rejected synthesis, test timeouts) are recorded
//! on the affected unit and never surface as a [`ProbeError`].

/// Run-fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("extraction failed: {0}")]
    Extraction(#[from] crate::extract::ExtractError),

    #[error("commit {commit} is non-empty but produced no analyzable units")]
    NoUnitsExtracted { commit: String },

    #[error("cache conflict: {0}")]
    CacheConflict(#[from] crate::cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
