//! Errors raised by the persistence layer.

use thiserror::Error;

use warden_core::{AuthError, ErrorKind};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A domain rule failed (unknown group, missing row, bad filter...).
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The database failed. The driver error is kept as the source.
    #[error("storage failure during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Domain error kind, or `None` for storage failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Auth(err) => Some(err.kind()),
            Self::Storage { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Auth(err) if err.is_not_found())
    }
}

/// Tag a driver error with the operation that raised it.
pub(crate) fn map_sqlx_error(operation: &'static str, source: sqlx::Error) -> StoreError {
    StoreError::Storage { operation, source }
}
