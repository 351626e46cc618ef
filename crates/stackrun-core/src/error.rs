//! Error types for stackrun.

use thiserror::Error;

/// Errors raised by provisioners, readiness probes and core types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("status check failed: {0}")]
    StatusFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
