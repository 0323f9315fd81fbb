//! Crate-level error taxonomy, following §7: one variant per failure category,
//! each wrapping a subsystem-specific `thiserror` enum.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("cancelled")]
    Cancelled,
    #[error("all {failed} of {total} downloads failed: {first_error}")]
    AllFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },
    #[error("http error: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider '{0}' not registered")]
    NotFound(String),
    #[error("provider call failed: {0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Top-level engine error. `run_job` catches every variant except
/// `Validation`/`NotFound` (those are raised synchronously to the submitter,
/// per §7's propagation policy) and persists the rest as job failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
