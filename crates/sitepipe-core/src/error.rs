//! Error types for sitepipe.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// When in the lifecycle an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    /// Detected while assembling the definition; nothing was provisioned.
    Definition,
    /// Detected while realizing the definition; provisioning is aborted.
    Provisioning,
    /// Detected while a pipeline run executes.
    Execution,
}

impl Error {
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Error::InvalidDefinition(_) => ErrorPhase::Definition,
            Error::Provisioning(_) | Error::Conflict(_) => ErrorPhase::Provisioning,
            _ => ErrorPhase::Execution,
        }
    }

    /// Whether an operation that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExecutionFailed(_) | Error::DeploymentFailed(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
