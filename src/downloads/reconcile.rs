//! Reconciliation of the ledger against the transfer backend
//!
//! Runs on every initialize and every background wake. Each pass asks the
//! backend what it knows about every non-terminal task and converges the
//! ledger towards it. A pass with nothing new to report changes nothing.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::manager::DownloadTaskManager;
use crate::database::{DownloadStatus, DownloadTask};
use crate::error::DownloadResult;
use crate::transfer::{TransferRequest, TransferState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Full,
    /// Finished transfers only
    Completed,
    /// Restart running tasks that lost their transfer
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Resumed,
    Adopted,
    Unchanged,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub resumed: usize,
    pub adopted: usize,
    /// Tasks whose query timed out or errored; retried on the next pass
    pub skipped: usize,
}

impl ReconcileSummary {
    pub fn merge(&mut self, other: &ReconcileSummary) {
        self.checked += other.checked;
        self.completed += other.completed;
        self.failed += other.failed;
        self.resumed += other.resumed;
        self.adopted += other.adopted;
        self.skipped += other.skipped;
    }

    pub fn is_quiet(&self) -> bool {
        self.completed == 0 && self.failed == 0 && self.resumed == 0 && self.adopted == 0
    }
}

impl DownloadTaskManager {
    /// Full reconciliation pass
    pub async fn reconcile(&self) -> ReconcileSummary {
        self.run_pass(Pass::Full).await
    }

    /// Hand off every transfer the backend reports as finished.
    /// Returns the number of downloads completed.
    pub async fn process_completed_downloads(&self) -> usize {
        self.run_pass(Pass::Completed).await.completed
    }

    /// Restart starting/downloading tasks whose transfer was interrupted.
    /// Returns the number restarted.
    pub async fn ensure_downloads_are_running(&self) -> usize {
        self.run_pass(Pass::Interrupted).await.resumed
    }

    /// Cancel paused downloads untouched for longer than the configured TTL
    pub async fn expire_idle_paused(&self) -> usize {
        let Some(ttl) = self.config.paused_ttl else {
            return 0;
        };
        let ttl = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => ttl,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - ttl;

        let expired: Vec<DownloadTask> = self
            .active_tasks()
            .into_iter()
            .filter(|t| t.status == DownloadStatus::Paused && t.last_updated_at < cutoff)
            .collect();

        let mut removed = 0;
        for task in expired {
            log::info!(
                "Paused download of {} idle since {}, reclaiming",
                task.destination_file_name,
                task.last_updated_at
            );
            match self.cancel_download(&task.download_id).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to expire {}: {}", task.destination_file_name, e),
            }
        }
        removed
    }

    async fn run_pass(&self, pass: Pass) -> ReconcileSummary {
        let _guard = self.ledger_lock.lock().await;
        let mut summary = ReconcileSummary::default();

        for task in self.active_tasks() {
            if self.cancelled.contains(&task.download_id) {
                continue;
            }
            summary.checked += 1;

            let temp = self.files.temp_path(&task.destination_file_name);
            let state = match tokio::time::timeout(
                self.config.query_timeout,
                self.backend.query(&task.download_id, &temp),
            )
            .await
            {
                Ok(state) => state,
                Err(_) => {
                    log::warn!(
                        "Query for {} timed out, will retry on the next pass",
                        task.destination_file_name
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            let name = task.destination_file_name.clone();
            match self.reconcile_task(task, state, pass).await {
                Ok(TaskOutcome::Completed) => summary.completed += 1,
                Ok(TaskOutcome::Failed) => summary.failed += 1,
                Ok(TaskOutcome::Resumed) => summary.resumed += 1,
                Ok(TaskOutcome::Adopted) => summary.adopted += 1,
                Ok(TaskOutcome::Unchanged) => {}
                Err(e) => {
                    log::error!("Reconciliation of {} failed: {}", name, e);
                    summary.skipped += 1;
                }
            }
        }

        if !summary.is_quiet() {
            log::info!("Reconciliation {:?}: {:?}", pass, summary);
        }
        summary
    }

    async fn reconcile_task(
        &self,
        mut task: DownloadTask,
        state: TransferState,
        pass: Pass,
    ) -> DownloadResult<TaskOutcome> {
        match (state, pass) {
            (TransferState::Finished { total_bytes }, Pass::Full | Pass::Completed) => {
                self.finalize_locked(task, total_bytes).await?;
                Ok(TaskOutcome::Completed)
            }
            (TransferState::Failed { reason }, Pass::Full) => {
                self.fail_locked(task, &reason).await;
                Ok(TaskOutcome::Failed)
            }
            (TransferState::Gone, Pass::Full) => {
                self.fail_locked(task, "Transfer no longer exists").await;
                Ok(TaskOutcome::Failed)
            }
            (TransferState::Active { bytes_downloaded, total_bytes }, Pass::Full) => {
                self.adopt(&mut task, DownloadStatus::Downloading, bytes_downloaded, total_bytes)
            }
            (TransferState::Paused { bytes_downloaded, total_bytes }, Pass::Full) => {
                self.adopt(&mut task, DownloadStatus::Paused, bytes_downloaded, total_bytes)
            }
            (TransferState::Interrupted { bytes_on_disk }, Pass::Full | Pass::Interrupted)
                if task.status.is_running() =>
            {
                self.restart(task, bytes_on_disk).await
            }
            _ => Ok(TaskOutcome::Unchanged),
        }
    }

    fn adopt(
        &self,
        task: &mut DownloadTask,
        status: DownloadStatus,
        bytes_downloaded: u64,
        total_bytes: u64,
    ) -> DownloadResult<TaskOutcome> {
        let total_bytes = if total_bytes > 0 { total_bytes } else { task.total_bytes };
        if task.status == status
            && task.bytes_downloaded == bytes_downloaded
            && task.total_bytes == total_bytes
        {
            return Ok(TaskOutcome::Unchanged);
        }
        if task.status != status && !task.status.can_transition_to(status) {
            log::debug!(
                "Not adopting {} for {} while it is {}",
                status,
                task.destination_file_name,
                task.status
            );
            return Ok(TaskOutcome::Unchanged);
        }

        task.status = status;
        task.bytes_downloaded = bytes_downloaded;
        task.total_bytes = total_bytes;
        task.touch();
        self.persist(task)?;
        self.emit_progress(task);
        Ok(TaskOutcome::Adopted)
    }

    async fn restart(&self, mut task: DownloadTask, offset: u64) -> DownloadResult<TaskOutcome> {
        log::info!(
            "Restarting interrupted download of {} from byte {}",
            task.destination_file_name,
            offset
        );

        let request = TransferRequest {
            download_id: task.download_id.clone(),
            url: task.source_url.clone(),
            destination: self.files.temp_path(&task.destination_file_name),
            resume_from: offset,
        };
        if let Err(e) = self.backend.start(request).await {
            self.fail_locked(task, &format!("Failed to restart: {}", e)).await;
            return Ok(TaskOutcome::Failed);
        }

        task.status = DownloadStatus::Downloading;
        task.bytes_downloaded = offset;
        task.touch();
        self.persist(&task)?;
        self.emit_progress(&task);
        Ok(TaskOutcome::Resumed)
    }
}
