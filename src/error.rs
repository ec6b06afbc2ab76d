//! Coarse error taxonomy shared across the core (§7). Each variant maps to
//! a status code at the admin/router boundary; the mapping lives with the
//! variant so callers don't have to duplicate the table.

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupted record: {0}")]
    Corruption(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("ssl issuance failed: {0}")]
    SslIssuanceFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The status code this error maps to at the REST/router boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Corruption(_) => 500,
            CoreError::UpstreamUnavailable(_) => 502,
            CoreError::SslIssuanceFailed(_) => 500,
            CoreError::Internal(_) => 500,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => CoreError::NotFound(id.to_string()),
            StorageError::Corruption => CoreError::Corruption(err.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}
