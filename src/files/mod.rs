//! On-disk layout: durable models directory plus a scratch directory for
//! partial downloads and in-flight imports.

use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{DownloadError, DownloadResult};
use crate::events::{DownloaderEvent, EventEmitter, ImportProgressEvent, ImportStatus};

const TEMP_SUFFIX: &str = ".tmp";
const IMPORT_SUFFIX: &str = ".import";
const COPY_CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub struct FileManager {
    models_dir: PathBuf,
    temp_dir: PathBuf,
    /// Imports in flight, keyed by destination name
    active_imports: DashMap<String, PathBuf>,
    events: EventEmitter<DownloaderEvent>,
}

impl FileManager {
    pub fn new(models_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            models_dir,
            temp_dir,
            active_imports: DashMap::new(),
            events: EventEmitter::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Emits `importProgress`
    pub fn events(&self) -> &EventEmitter<DownloaderEvent> {
        &self.events
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.models_dir.join(name)
    }

    /// Where the partial download for `name` lives
    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_dir.join(format!("{}{}", name, TEMP_SUFFIX))
    }

    fn import_path(&self, name: &str) -> PathBuf {
        self.temp_dir.join(format!("{}{}", name, IMPORT_SUFFIX))
    }

    /// Create both directories. Safe to call repeatedly.
    pub async fn initialize_directories(&self) -> DownloadResult<()> {
        fs::create_dir_all(&self.models_dir)
            .await
            .map_err(|e| DownloadError::io("Failed to create models directory", e))?;
        fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| DownloadError::io("Failed to create temp directory", e))?;

        log::info!(
            "Model directories ready: models={}, temp={}",
            self.models_dir.display(),
            self.temp_dir.display()
        );
        Ok(())
    }

    /// Move a finished file into place. Falls back to copying when a plain
    /// rename is impossible (different volumes).
    pub async fn move_completed_file(&self, temp_path: &Path, final_path: &Path) -> DownloadResult<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io("Failed to create destination directory", e))?;
        }

        match fs::rename(temp_path, final_path).await {
            Ok(()) => {
                log::info!("Moved {} -> {}", temp_path.display(), final_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DownloadError::io("Completed file is missing", e))
            }
            Err(e) => {
                log::warn!(
                    "Rename of {} failed ({}), falling back to copy",
                    temp_path.display(),
                    e
                );
                copy_then_rename(temp_path, final_path).await
            }
        }
    }

    /// Remove temp files not named in `keep` (destination file names of
    /// non-terminal downloads). In-flight imports are never touched.
    /// Returns the number of files removed.
    pub async fn cleanup_temp_directory(&self, keep: &HashSet<String>) -> DownloadResult<usize> {
        let mut entries = match fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DownloadError::io("Failed to read temp directory", e)),
        };

        let keep_paths: HashSet<PathBuf> = keep
            .iter()
            .map(|name| self.temp_path(name))
            .chain(self.active_imports.iter().map(|entry| entry.value().clone()))
            .collect();

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::io("Failed to read temp directory", e))?
        {
            let path = entry.path();
            if keep_paths.contains(&path) {
                continue;
            }

            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if !file_type.is_file() {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    log::info!("Removed orphaned temp file {}", path.display());
                    removed += 1;
                }
                Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    /// Remove the partial download for `name` if there is one
    pub async fn remove_temp_file(&self, name: &str) -> DownloadResult<bool> {
        match fs::remove_file(self.temp_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DownloadError::io("Failed to remove temp file", e)),
        }
    }

    /// Size of the partial download for `name`, 0 when absent
    pub async fn temp_file_size(&self, name: &str) -> u64 {
        fs::metadata(self.temp_path(name))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Copy an external file into the models directory under `dest_name`,
    /// publishing `importProgress` as it goes.
    pub async fn import_external_file(&self, source: &Path, dest_name: &str) -> DownloadResult<PathBuf> {
        let final_path = self.model_path(dest_name);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(DownloadError::Conflict(format!("{} already exists", dest_name)));
        }

        let staging = self.import_path(dest_name);
        if self.active_imports.insert(dest_name.to_string(), staging.clone()).is_some() {
            return Err(DownloadError::Conflict(format!("{} is already being imported", dest_name)));
        }

        let result = self.copy_with_progress(source, &staging, &final_path, dest_name).await;
        self.active_imports.remove(dest_name);

        match result {
            Ok(total) => {
                self.emit_import(dest_name, ImportStatus::Completed, 100, total, total, None);
                log::info!("Imported {} ({} bytes)", dest_name, total);
                Ok(final_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                self.emit_import(dest_name, ImportStatus::Error, 0, 0, 0, Some(e.to_string()));
                log::error!("Import of {} failed: {}", dest_name, e);
                Err(e)
            }
        }
    }

    async fn copy_with_progress(
        &self,
        source: &Path,
        staging: &Path,
        final_path: &Path,
        dest_name: &str,
    ) -> DownloadResult<u64> {
        fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| DownloadError::io("Failed to create temp directory", e))?;

        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| DownloadError::io("Failed to open import source", e))?;
        let total = reader
            .metadata()
            .await
            .map_err(|e| DownloadError::io("Failed to stat import source", e))?
            .len();
        let mut writer = fs::File::create(staging)
            .await
            .map_err(|e| DownloadError::io("Failed to create import file", e))?;

        self.emit_import(dest_name, ImportStatus::Importing, 0, 0, total, None);

        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut copied: u64 = 0;
        let mut last_percent = 0u8;
        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io("Failed to read import source", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|e| DownloadError::io("Failed to write import file", e))?;
            copied += n as u64;

            let percent = crate::database::progress_percent(copied, total);
            if percent != last_percent {
                last_percent = percent;
                self.emit_import(dest_name, ImportStatus::Importing, percent, copied, total, None);
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io("Failed to flush import file", e))?;
        writer
            .sync_all()
            .await
            .map_err(|e| DownloadError::io("Failed to sync import file", e))?;
        drop(writer);

        if fs::try_exists(final_path).await.unwrap_or(false) {
            return Err(DownloadError::Conflict(format!("{} already exists", dest_name)));
        }
        self.move_completed_file(staging, final_path).await?;
        Ok(copied)
    }

    fn emit_import(
        &self,
        name: &str,
        status: ImportStatus,
        progress: u8,
        bytes_copied: u64,
        total_bytes: u64,
        error: Option<String>,
    ) {
        self.events.emit(&DownloaderEvent::ImportProgress(ImportProgressEvent {
            model_name: name.to_string(),
            status,
            progress,
            bytes_copied,
            total_bytes,
            error,
        }));
    }
}

async fn copy_then_rename(source: &Path, final_path: &Path) -> DownloadResult<()> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("model");
    let sibling = final_path.with_file_name(format!("{}.partial", file_name));

    if let Err(e) = fs::copy(source, &sibling).await {
        let _ = fs::remove_file(&sibling).await;
        return Err(DownloadError::io("Failed to copy completed file", e));
    }
    fs::rename(&sibling, final_path)
        .await
        .map_err(|e| DownloadError::io("Failed to move copied file into place", e))?;
    if let Err(e) = fs::remove_file(source).await {
        log::warn!("Copied {} but could not remove it: {}", source.display(), e);
    }
    Ok(())
}
