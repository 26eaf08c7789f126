//! Error types for download and inventory operations

use thiserror::Error;

use crate::transfer::TransferError;

/// Errors returned by the download managers and the facade
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Bad file name, extension or URL. Raised before any ledger mutation.
    #[error("Invalid request: {0}")]
    Validation(String),
    /// A download or stored model already claims the target name
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Transfer failed or could not be started
    #[error("Network error: {0}")]
    Network(String),
    /// Disk full, permission denied, missing file...
    #[error("Filesystem error: {0}")]
    Filesystem(String),
    /// Unknown download id or model path
    #[error("Not found: {0}")]
    NotFound(String),
    /// Operation not allowed in the task's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Ledger / registry persistence failed
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("Initialization failed: {0}")]
    Initialization(String),
}

impl DownloadError {
    /// Wrap an I/O error with the operation that produced it
    pub fn io(context: &str, err: std::io::Error) -> Self {
        DownloadError::Filesystem(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Filesystem(err.to_string())
    }
}

impl From<TransferError> for DownloadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => DownloadError::Filesystem(e.to_string()),
            other => DownloadError::Network(other.to_string()),
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
