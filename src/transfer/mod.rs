//! The resumable transfer primitive the download manager drives.
//!
//! A backend moves bytes from a URL into a destination file and reports
//! progress through an update channel. It may outlive the process (an OS
//! download service) or live inside it (`HttpTransferBackend`); either way the
//! manager only trusts what `query` says after a restart.

pub mod http;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

pub use http::HttpTransferBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub download_id: String,
    pub url: String,
    /// Partial file the bytes are written to
    pub destination: PathBuf,
    /// Byte offset to continue from, 0 for a fresh transfer
    pub resume_from: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { bytes_downloaded: u64, total_bytes: u64 },
    Finished { total_bytes: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUpdate {
    pub download_id: String,
    pub event: TransferEvent,
}

pub type UpdateSink = mpsc::UnboundedSender<TransferUpdate>;

/// What the backend knows about a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Active { bytes_downloaded: u64, total_bytes: u64 },
    Paused { bytes_downloaded: u64, total_bytes: u64 },
    /// All bytes are in the destination file
    Finished { total_bytes: u64 },
    Failed { reason: String },
    /// No live handle, but a partial file is on disk
    Interrupted { bytes_on_disk: u64 },
    /// Neither a handle nor any data
    Gone,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("Transfer request failed: {0}")]
    Request(String),
    #[error("Transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Route updates for every transfer into `sink`. Replaces any earlier sink.
    fn attach(&self, sink: UpdateSink);

    async fn start(&self, request: TransferRequest) -> Result<(), TransferError>;

    /// Stop moving bytes but keep the partial file and the handle
    async fn pause(&self, download_id: &str) -> Result<(), TransferError>;

    async fn resume(&self, download_id: &str) -> Result<(), TransferError>;

    /// Abort and forget the transfer. The partial file is the caller's to remove.
    async fn cancel(&self, download_id: &str) -> Result<(), TransferError>;

    /// Drop bookkeeping for a transfer the caller has finished with
    fn release(&self, download_id: &str);

    async fn query(&self, download_id: &str, destination: &Path) -> TransferState;

    /// Server-suggested file name for `url`, if the backend can find one
    async fn probe_file_name(&self, _url: &str) -> Option<String> {
        None
    }
}
