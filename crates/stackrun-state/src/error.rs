//! State store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state file: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported state version {found} (this build supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("state belongs to stack '{found}', expected '{expected}'")]
    StackMismatch { expected: String, found: String },

    #[error("state for stack '{stack}' changed since it was loaded (serial {expected}, found {found})")]
    Stale {
        stack: String,
        expected: u64,
        found: u64,
    },
}

pub type StateResult<T> = std::result::Result<T, StateError>;
