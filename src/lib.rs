// Model Downloader - resumable model downloads and local model inventory
//
// Moves large model files from remote URLs into durable local storage,
// survives restarts and background wakes, and keeps track of both
// downloaded and externally linked models.

pub mod config;
pub mod database;
pub mod downloader;
pub mod downloads;
pub mod error;
pub mod events;
pub mod files;
pub mod naming;
pub mod notifications;
pub mod storage;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use config::{default_data_dir, DownloaderConfig};
pub use database::{DatabaseManager, DownloadStatus, DownloadTask, ExternalLink};
pub use downloader::{global, install, instance, BackgroundCheckSummary, ModelDownloader};
pub use downloads::{DownloadHandle, ReconcileSummary};
pub use error::{DownloadError, DownloadResult};
pub use events::{
    DownloadProgressEvent, DownloaderEvent, EventEmitter, ImportProgressEvent, ImportStatus,
    ListenerId, DOWNLOAD_PROGRESS, IMPORT_PROGRESS, MODELS_CHANGED,
};
pub use notifications::{DownloadNotifier, LogNotifier};
pub use storage::{ModelSource, StoredModel};
pub use transfer::{HttpTransferBackend, TransferBackend, TransferState};
