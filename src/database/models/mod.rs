// Database models - Re-exports all persisted record types
//
// - download_task.rs: Download ledger entries and their status machine
// - external_link.rs: Registry of linked (not copied) model files
// - settings.rs: Key-value settings and downloader overrides

mod download_task;
mod external_link;
mod settings;

pub use download_task::{progress_percent, DownloadStatus, DownloadTask};
pub use external_link::ExternalLink;
pub use settings::DownloadSettings;
