use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of an error, used by the API and RPC surfaces to
/// pick a status code without inspecting the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unauthenticated,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, Error)]
pub enum OrchestraError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestraError::NotFound(_) => ErrorKind::NotFound,
            OrchestraError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            OrchestraError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            OrchestraError::Unauthenticated => ErrorKind::Unauthenticated,
            OrchestraError::Unavailable(_) => ErrorKind::Unavailable,
            OrchestraError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            OrchestraError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        OrchestraError::NotFound(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        OrchestraError::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        OrchestraError::FailedPrecondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        OrchestraError::Internal(msg.into())
    }
}
