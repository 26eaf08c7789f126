// Database models - Download ledger
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a download task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Starting => "starting",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" | "pending" => Some(DownloadStatus::Starting),
            "downloading" | "running" => Some(DownloadStatus::Downloading),
            "paused" => Some(DownloadStatus::Paused),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "cancelled" | "canceled" => Some(DownloadStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Whether bytes are (expected to be) flowing
    pub fn is_running(&self) -> bool {
        matches!(self, DownloadStatus::Starting | DownloadStatus::Downloading)
    }

    /// Allowed transitions of the task state machine
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Starting, Downloading | Completed | Failed | Cancelled) => true,
            (Downloading, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Downloading | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer percentage, 0 while the total size is unknown
pub fn progress_percent(bytes_downloaded: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 0;
    }
    let percent = (bytes_downloaded as u128 * 100) / total_bytes as u128;
    percent.min(100) as u8
}

/// One in-flight transfer, persisted in the ledger keyed by file name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub download_id: String,
    pub source_url: String,
    pub destination_file_name: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// 0 when the server did not report a length
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl DownloadTask {
    /// New task in `starting` with a fresh id
    pub fn new(source_url: &str, destination_file_name: &str) -> Self {
        let now = Utc::now();
        Self {
            download_id: uuid::Uuid::new_v4().to_string(),
            source_url: source_url.to_string(),
            destination_file_name: destination_file_name.to_string(),
            status: DownloadStatus::Starting,
            bytes_downloaded: 0,
            total_bytes: 0,
            created_at: now,
            last_updated_at: now,
            error_message: None,
        }
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.bytes_downloaded, self.total_bytes)
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}
