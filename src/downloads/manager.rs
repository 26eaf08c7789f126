//! DownloadTaskManager - one ledger entry per in-flight transfer
//!
//! Commands, transfer updates and reconciliation all serialize on
//! `ledger_lock`. Cancellation marks its fence before taking the lock so a
//! completion that is still waiting for the lock is discarded.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use super::progress::ProgressThrottle;
use crate::config::DownloaderConfig;
use crate::database::{DatabaseManager, DownloadStatus, DownloadTask};
use crate::error::{DownloadError, DownloadResult};
use crate::events::{DownloadProgressEvent, DownloaderEvent, EventEmitter};
use crate::files::FileManager;
use crate::naming::{normalized_base_name, validate_file_name, validate_url};
use crate::notifications::DownloadNotifier;
use crate::storage::{StoredModel, StoredModelsManager};
use crate::transfer::{TransferBackend, TransferError, TransferEvent, TransferRequest, TransferUpdate};

/// Returned by `download_model`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadHandle {
    pub download_id: String,
}

pub struct DownloadTaskManager {
    pub(super) db: Arc<DatabaseManager>,
    pub(super) files: Arc<FileManager>,
    pub(super) stored: Arc<StoredModelsManager>,
    pub(super) backend: Arc<dyn TransferBackend>,
    pub(super) notifier: Arc<dyn DownloadNotifier>,
    pub(super) config: Arc<DownloaderConfig>,
    /// Non-terminal tasks keyed by destination file name
    pub(super) tasks: DashMap<String, DownloadTask>,
    /// download id -> destination file name
    ids: DashMap<String, String>,
    /// Fenced download ids; their updates are dropped
    pub(super) cancelled: DashSet<String>,
    throttle: ProgressThrottle,
    pub(super) ledger_lock: Mutex<()>,
    events: EventEmitter<DownloaderEvent>,
    idle: Notify,
    /// Buffered until the pump starts
    updates: StdMutex<Option<mpsc::UnboundedReceiver<TransferUpdate>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl DownloadTaskManager {
    pub fn new(
        db: Arc<DatabaseManager>,
        files: Arc<FileManager>,
        stored: Arc<StoredModelsManager>,
        backend: Arc<dyn TransferBackend>,
        notifier: Arc<dyn DownloadNotifier>,
        config: Arc<DownloaderConfig>,
    ) -> Self {
        // Attach right away so nothing sent during reconciliation is lost
        let (tx, rx) = mpsc::unbounded_channel::<TransferUpdate>();
        backend.attach(tx);

        Self {
            throttle: ProgressThrottle::new(config.ledger_flush_interval),
            db,
            files,
            stored,
            backend,
            notifier,
            config,
            tasks: DashMap::new(),
            ids: DashMap::new(),
            cancelled: DashSet::new(),
            ledger_lock: Mutex::new(()),
            events: EventEmitter::new(),
            idle: Notify::new(),
            updates: StdMutex::new(Some(rx)),
            pump: StdMutex::new(None),
        }
    }

    /// Emits `downloadProgress`
    pub fn events(&self) -> &EventEmitter<DownloaderEvent> {
        &self.events
    }

    /// Rebuild in-memory state from the ledger. Terminal rows left behind by
    /// an interrupted handoff are dropped. Returns the number of tasks loaded.
    pub async fn load(&self) -> DownloadResult<usize> {
        let _guard = self.ledger_lock.lock().await;

        self.tasks.clear();
        self.ids.clear();
        self.cancelled.clear();

        for task in self.db.list_download_tasks()? {
            if task.status.is_terminal() {
                log::info!("Dropping terminal ledger entry for {}", task.destination_file_name);
                self.db.delete_download_task(&task.destination_file_name)?;
                continue;
            }
            self.ids.insert(task.download_id.clone(), task.destination_file_name.clone());
            self.tasks.insert(task.destination_file_name.clone(), task);
        }

        let loaded = self.tasks.len();
        log::info!("Loaded {} download tasks from the ledger", loaded);
        Ok(loaded)
    }

    /// Route backend updates into `handle_update`. Idempotent.
    pub fn start_update_pump(self: &Arc<Self>) {
        let receiver = match self.updates.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut rx) = receiver else {
            return;
        };

        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match manager.upgrade() {
                    Some(manager) => manager.handle_update(update).await,
                    None => break,
                }
            }
            log::debug!("Transfer update pump stopped");
        });

        match self.pump.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    /// Stop processing transfer updates
    pub fn shutdown(&self) {
        let handle = match self.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub async fn download_model(&self, url: &str, file_name: &str) -> DownloadResult<DownloadHandle> {
        validate_url(url)?;
        validate_file_name(file_name, &self.config.allowed_extensions)?;

        let _guard = self.ledger_lock.lock().await;

        if self.has_active(file_name) {
            return Err(DownloadError::Conflict(format!("{} is already downloading", file_name)));
        }
        if let Some(existing) = self.stored.find_conflict(file_name).await? {
            return Err(DownloadError::Conflict(format!(
                "{} conflicts with stored model {}",
                file_name, existing.display_name
            )));
        }

        let task = DownloadTask::new(url, file_name);
        self.persist(&task)?;

        // Leftovers from an earlier attempt would be appended to
        if let Err(e) = self.files.remove_temp_file(file_name).await {
            log::warn!("Could not clear stale temp file for {}: {}", file_name, e);
        }

        self.emit_progress(&task);

        let request = TransferRequest {
            download_id: task.download_id.clone(),
            url: url.to_string(),
            destination: self.files.temp_path(file_name),
            resume_from: 0,
        };
        if let Err(e) = self.backend.start(request).await {
            log::error!("Transfer for {} refused to start: {}", file_name, e);
            let reason = e.to_string();
            let mut failed = task.clone();
            failed.status = DownloadStatus::Failed;
            failed.error_message = Some(reason.clone());
            failed.touch();
            self.emit_progress(&failed);
            self.notifier.download_failed(file_name, &reason);
            if let Err(e) = self.forget(&task) {
                log::error!("Failed to remove ledger entry for {}: {}", file_name, e);
            }
            return Err(DownloadError::Network(format!(
                "Failed to start download of {}: {}",
                file_name, reason
            )));
        }

        log::info!("Download {} started for {}", task.download_id, file_name);
        Ok(DownloadHandle {
            download_id: task.download_id,
        })
    }

    /// Link or import an external model. Holds the ledger lock so no
    /// download for the same name can start in between.
    pub async fn link_external_model(&self, uri: &str, file_name: &str) -> DownloadResult<StoredModel> {
        let _guard = self.ledger_lock.lock().await;

        if self.has_active(file_name) {
            return Err(DownloadError::Conflict(format!(
                "{} is currently being downloaded",
                file_name
            )));
        }

        self.stored.link_external_model(uri, file_name).await
    }

    pub async fn pause_download(&self, download_id: &str) -> DownloadResult<()> {
        let _guard = self.ledger_lock.lock().await;
        let mut task = self.task_by_id(download_id)?;

        if !task.status.can_transition_to(DownloadStatus::Paused) {
            return Err(DownloadError::InvalidState(format!(
                "Cannot pause {} while it is {}",
                task.destination_file_name, task.status
            )));
        }

        match self.backend.pause(download_id).await {
            Ok(()) => {}
            Err(TransferError::UnknownTransfer(_)) => {
                log::warn!("Transfer {} has no live handle, keeping partial data", download_id);
            }
            Err(e) => return Err(e.into()),
        }

        let temp = self.files.temp_path(&task.destination_file_name);
        match self.backend.query(download_id, &temp).await {
            crate::transfer::TransferState::Paused { bytes_downloaded, total_bytes } => {
                task.bytes_downloaded = bytes_downloaded;
                if total_bytes > 0 {
                    task.total_bytes = total_bytes;
                }
            }
            crate::transfer::TransferState::Interrupted { bytes_on_disk } => {
                task.bytes_downloaded = bytes_on_disk;
            }
            _ => {}
        }

        task.status = DownloadStatus::Paused;
        task.touch();
        self.persist(&task)?;
        self.emit_progress(&task);
        self.idle.notify_waiters();

        log::info!("Paused {} at {} bytes", task.destination_file_name, task.bytes_downloaded);
        Ok(())
    }

    pub async fn resume_download(&self, download_id: &str) -> DownloadResult<()> {
        let _guard = self.ledger_lock.lock().await;
        let mut task = self.task_by_id(download_id)?;

        if task.status != DownloadStatus::Paused {
            return Err(DownloadError::InvalidState(format!(
                "Cannot resume {} while it is {}",
                task.destination_file_name, task.status
            )));
        }

        match self.backend.resume(download_id).await {
            Ok(()) => {}
            Err(TransferError::UnknownTransfer(_)) => {
                // Handle lost (restart); continue from the partial file
                let offset = self.files.temp_file_size(&task.destination_file_name).await;
                log::info!(
                    "Restarting {} from byte {} after losing its transfer handle",
                    task.destination_file_name,
                    offset
                );
                let request = TransferRequest {
                    download_id: task.download_id.clone(),
                    url: task.source_url.clone(),
                    destination: self.files.temp_path(&task.destination_file_name),
                    resume_from: offset,
                };
                self.backend.start(request).await.map_err(|e| {
                    DownloadError::Network(format!(
                        "Failed to restart {}: {}",
                        task.destination_file_name, e
                    ))
                })?;
                task.bytes_downloaded = offset;
            }
            Err(e) => return Err(e.into()),
        }

        task.status = DownloadStatus::Downloading;
        task.touch();
        self.persist(&task)?;
        self.emit_progress(&task);

        log::info!("Resumed {}", task.destination_file_name);
        Ok(())
    }

    pub async fn cancel_download(&self, download_id: &str) -> DownloadResult<()> {
        // Fence before waiting for the lock
        self.cancelled.insert(download_id.to_string());

        let _guard = self.ledger_lock.lock().await;
        let mut task = match self.task_by_id(download_id) {
            Ok(task) => task,
            Err(e) => {
                self.cancelled.remove(download_id);
                return Err(e);
            }
        };

        match self.backend.cancel(download_id).await {
            Ok(()) => {}
            Err(TransferError::UnknownTransfer(_)) => {
                log::debug!("Transfer {} already gone on cancel", download_id);
            }
            Err(e) => log::warn!("Backend failed to cancel {}: {}", download_id, e),
        }

        if let Err(e) = self.files.remove_temp_file(&task.destination_file_name).await {
            log::warn!("Failed to remove partial file for {}: {}", task.destination_file_name, e);
        }
        let forgotten = self.forget(&task);
        // The task is gone from memory, so late updates for this id are
        // already dropped as unknown and the fence can go
        self.cancelled.remove(download_id);
        forgotten?;

        task.status = DownloadStatus::Cancelled;
        task.touch();
        self.emit_progress(&task);
        self.notifier.dismiss(&task.destination_file_name);

        log::info!("Cancelled download of {}", task.destination_file_name);
        Ok(())
    }

    /// Apply one update from the transfer backend
    pub async fn handle_update(&self, update: TransferUpdate) {
        if self.cancelled.contains(&update.download_id) {
            log::debug!("Dropping update for cancelled download {}", update.download_id);
            return;
        }

        let _guard = self.ledger_lock.lock().await;
        // A cancel may have fenced the id while we waited
        if self.cancelled.contains(&update.download_id) {
            log::debug!("Dropping update for cancelled download {}", update.download_id);
            return;
        }

        let task = match self.task_by_id(&update.download_id) {
            Ok(task) => task,
            Err(_) => {
                log::debug!("Update for unknown download {}", update.download_id);
                return;
            }
        };

        match update.event {
            TransferEvent::Progress { bytes_downloaded, total_bytes } => {
                self.apply_progress(task, bytes_downloaded, total_bytes);
            }
            TransferEvent::Finished { total_bytes } => {
                if let Err(e) = self.finalize_locked(task, total_bytes).await {
                    log::error!("Completion handoff failed: {}", e);
                }
            }
            TransferEvent::Failed { reason } => {
                self.fail_locked(task, &reason).await;
            }
        }
    }

    fn apply_progress(&self, mut task: DownloadTask, bytes_downloaded: u64, total_bytes: u64) {
        if task.status == DownloadStatus::Paused {
            log::debug!("Ignoring progress for paused {}", task.destination_file_name);
            return;
        }

        let status_changed = task.status != DownloadStatus::Downloading;
        if status_changed && !task.status.can_transition_to(DownloadStatus::Downloading) {
            log::warn!(
                "Ignoring progress for {} while it is {}",
                task.destination_file_name,
                task.status
            );
            return;
        }
        task.status = DownloadStatus::Downloading;
        task.bytes_downloaded = bytes_downloaded;
        if total_bytes > 0 {
            task.total_bytes = total_bytes;
        }
        task.touch();
        self.tasks.insert(task.destination_file_name.clone(), task.clone());

        let percent = task.progress_percent();
        if self.throttle.should_flush(&task.download_id, percent, status_changed) {
            if let Err(e) = self.db.upsert_download_task(&task) {
                log::warn!("Failed to persist progress for {}: {:#}", task.destination_file_name, e);
            }
            self.emit_progress(&task);
            self.notifier.download_progress(&task.destination_file_name, percent);
        }
    }

    /// Completion handoff: move, announce, register, then drop the ledger row.
    /// Caller holds the ledger lock.
    pub(super) async fn finalize_locked(&self, mut task: DownloadTask, total_bytes: u64) -> DownloadResult<()> {
        let name = task.destination_file_name.clone();
        let temp = self.files.temp_path(&name);
        let dest = self.files.model_path(&name);

        if let Err(e) = self.files.move_completed_file(&temp, &dest).await {
            let temp_exists = path_exists(&temp).await;
            let dest_exists = path_exists(&dest).await;
            if !temp_exists && dest_exists {
                log::info!("{} was already moved into place", name);
            } else {
                self.fail_locked(task, &e.to_string()).await;
                return Err(e);
            }
        }

        let size = tokio::fs::metadata(&dest)
            .await
            .map(|m| m.len())
            .unwrap_or(total_bytes);
        task.status = DownloadStatus::Completed;
        task.bytes_downloaded = size;
        task.total_bytes = size;
        task.error_message = None;
        task.touch();

        let mut event = DownloadProgressEvent::from_task(&task);
        event.progress = 100;
        self.events.emit(&DownloaderEvent::DownloadProgress(event));

        if let Err(e) = self.stored.register_downloaded(&name).await {
            log::error!("Failed to register downloaded model {}: {}", name, e);
        }

        self.backend.release(&task.download_id);
        self.forget(&task)?;
        self.notifier.download_completed(&name);

        log::info!("Download of {} completed ({} bytes)", name, size);
        Ok(())
    }

    /// Report a failure, then drop the task. Caller holds the ledger lock.
    pub(super) async fn fail_locked(&self, mut task: DownloadTask, reason: &str) {
        let name = task.destination_file_name.clone();
        task.status = DownloadStatus::Failed;
        task.error_message = Some(reason.to_string());
        task.touch();

        self.emit_progress(&task);
        self.backend.release(&task.download_id);

        if let Err(e) = self.files.remove_temp_file(&name).await {
            log::warn!("Failed to remove partial file for {}: {}", name, e);
        }
        if let Err(e) = self.forget(&task) {
            log::error!("Failed to remove ledger entry for {}: {}", name, e);
        }
        self.notifier.download_failed(&name, reason);

        log::error!("Download of {} failed: {}", name, reason);
    }

    /// Resolves once nothing is starting or downloading, or after `timeout`.
    /// Returns whether the manager went idle.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if !self.has_running() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(250));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Non-terminal tasks, oldest first
    pub fn active_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.destination_file_name.cmp(&b.destination_file_name))
        });
        tasks
    }

    pub fn active_file_names(&self) -> HashSet<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn find_task(&self, download_id: &str) -> Option<DownloadTask> {
        self.task_by_id(download_id).ok()
    }

    /// Whether a non-terminal task targets a name colliding with `file_name`
    pub fn has_active(&self, file_name: &str) -> bool {
        let wanted = normalized_base_name(file_name);
        self.tasks
            .iter()
            .any(|e| normalized_base_name(e.key()) == wanted)
    }

    pub fn has_running(&self) -> bool {
        self.tasks.iter().any(|e| e.value().status.is_running())
    }

    pub(super) fn task_by_id(&self, download_id: &str) -> DownloadResult<DownloadTask> {
        let name = self
            .ids
            .get(download_id)
            .map(|n| n.value().clone())
            .ok_or_else(|| DownloadError::NotFound(format!("No active download {}", download_id)))?;
        self.tasks
            .get(&name)
            .map(|t| t.value().clone())
            .ok_or_else(|| DownloadError::NotFound(format!("No active download {}", download_id)))
    }

    /// Write the ledger row and the in-memory copy. Rejects status changes
    /// the task state machine does not allow.
    pub(super) fn persist(&self, task: &DownloadTask) -> DownloadResult<()> {
        self.check_transition(task)?;
        self.db.upsert_download_task(task)?;
        self.ids.insert(task.download_id.clone(), task.destination_file_name.clone());
        self.tasks.insert(task.destination_file_name.clone(), task.clone());
        Ok(())
    }

    pub(super) fn check_transition(&self, next: &DownloadTask) -> DownloadResult<()> {
        let current = self
            .tasks
            .get(&next.destination_file_name)
            .map(|t| t.value().status);
        match current {
            Some(current) if current != next.status && !current.can_transition_to(next.status) => {
                Err(DownloadError::InvalidState(format!(
                    "{} cannot move from {} to {}",
                    next.destination_file_name, current, next.status
                )))
            }
            _ => Ok(()),
        }
    }

    /// Drop every trace of a task that reached a terminal state
    fn forget(&self, task: &DownloadTask) -> DownloadResult<()> {
        self.tasks.remove(&task.destination_file_name);
        self.ids.remove(&task.download_id);
        self.throttle.forget(&task.download_id);
        self.idle.notify_waiters();
        self.db.delete_download_task(&task.destination_file_name)?;
        Ok(())
    }

    pub(super) fn emit_progress(&self, task: &DownloadTask) {
        self.events
            .emit(&DownloaderEvent::DownloadProgress(DownloadProgressEvent::from_task(task)));
    }
}

/// Existence check that logs I/O errors and treats them as absent
async fn path_exists(path: &Path) -> bool {
    match tokio::fs::try_exists(path).await {
        Ok(exists) => exists,
        Err(e) => {
            log::warn!("Could not check {}: {}", path.display(), e);
            false
        }
    }
}

impl Drop for DownloadTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
