//! Error types for WritePolicyBench

use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Main error type for WritePolicyBench
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed episode at record {index}: {message}")]
    MalformedEpisode { index: usize, message: String },

    #[error("Manifest mismatch: {0}")]
    ManifestMismatch(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl BenchError {
    /// True for errors that abort the whole run rather than one condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::InvariantViolation(_) | BenchError::ManifestMismatch(_)
        )
    }
}
