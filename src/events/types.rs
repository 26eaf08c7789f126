// Event payloads published by the managers and forwarded by the facade

use serde::{Deserialize, Serialize};

use super::NamedEvent;
use crate::database::models::{DownloadStatus, DownloadTask};

pub const DOWNLOAD_PROGRESS: &str = "downloadProgress";
pub const MODELS_CHANGED: &str = "modelsChanged";
pub const IMPORT_PROGRESS: &str = "importProgress";

/// Progress of a single download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub model_name: String,
    pub progress: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub status: DownloadStatus,
    pub download_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgressEvent {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            model_name: task.destination_file_name.clone(),
            progress: task.progress_percent(),
            bytes_downloaded: task.bytes_downloaded,
            total_bytes: task.total_bytes,
            status: task.status,
            download_id: task.download_id.clone(),
            error: task.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Importing,
    Completed,
    Error,
}

/// Progress of copying an external file into managed storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgressEvent {
    pub model_name: String,
    pub status: ImportStatus,
    pub progress: u8,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the download subsystem publishes to the UI layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum DownloaderEvent {
    DownloadProgress(DownloadProgressEvent),
    ModelsChanged,
    ImportProgress(ImportProgressEvent),
}

impl NamedEvent for DownloaderEvent {
    fn name(&self) -> &'static str {
        match self {
            DownloaderEvent::DownloadProgress(_) => DOWNLOAD_PROGRESS,
            DownloaderEvent::ModelsChanged => MODELS_CHANGED,
            DownloaderEvent::ImportProgress(_) => IMPORT_PROGRESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_serializes_camel_case() {
        let event = DownloadProgressEvent {
            model_name: "model.gguf".to_string(),
            progress: 40,
            bytes_downloaded: 400,
            total_bytes: 1000,
            status: DownloadStatus::Downloading,
            download_id: "abc".to_string(),
            error: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["modelName"], "model.gguf");
        assert_eq!(json["bytesDownloaded"], 400);
        assert_eq!(json["status"], "downloading");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(DownloaderEvent::ModelsChanged.name(), MODELS_CHANGED);
        let import = DownloaderEvent::ImportProgress(ImportProgressEvent {
            model_name: "a.gguf".to_string(),
            status: ImportStatus::Importing,
            progress: 0,
            bytes_copied: 0,
            total_bytes: 10,
            error: None,
        });
        assert_eq!(import.name(), IMPORT_PROGRESS);
    }
}
