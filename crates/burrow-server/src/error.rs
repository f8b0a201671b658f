//! Admin-facing error kinds

use thiserror::Error;

/// Errors surfaced by the admin facade and credential checks.
///
/// `OutOfRange` is a deliberate signal, not a failure: a list call found
/// nothing and the CLI should render an empty table.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Cancelled(String),
}

impl AdminError {
    /// Stable machine-readable kind string, carried in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::NotFound(_) => "NOT_FOUND",
            AdminError::AlreadyExists(_) => "ALREADY_EXISTS",
            AdminError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AdminError::Unauthenticated(_) => "UNAUTHENTICATED",
            AdminError::OutOfRange(_) => "OUT_OF_RANGE",
            AdminError::Internal(_) => "INTERNAL",
            AdminError::Cancelled(_) => "CANCELLED",
        }
    }
}
