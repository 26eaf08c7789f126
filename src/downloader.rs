//! ModelDownloader: the single entry point used by the UI layer and the
//! background worker.
//!
//! Composes the file, inventory and task managers, sequences their
//! initialization and re-publishes their events from one emitter.

use once_cell::sync::OnceCell as GlobalCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::DownloaderConfig;
use crate::database::{DatabaseManager, DownloadTask};
use crate::downloads::{DownloadHandle, DownloadTaskManager, ReconcileSummary};
use crate::error::{DownloadError, DownloadResult};
use crate::events::{
    DownloaderEvent, EventEmitter, ListenerId, DOWNLOAD_PROGRESS, IMPORT_PROGRESS, MODELS_CHANGED,
};
use crate::files::FileManager;
use crate::naming::{file_name_from_url, validate_url};
use crate::notifications::{DownloadNotifier, LogNotifier};
use crate::storage::{StoredModel, StoredModelsManager};
use crate::transfer::{HttpTransferBackend, TransferBackend};

static INSTANCE: GlobalCell<Arc<ModelDownloader>> = GlobalCell::new();

/// Outcome of one `check_background_downloads` pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundCheckSummary {
    pub reconcile: ReconcileSummary,
    pub expired_paused: usize,
    pub temp_files_removed: usize,
    pub models_changed: bool,
    pub active_downloads: usize,
    /// The pass ran out of budget; whatever it had not reached is retried next time
    pub timed_out: bool,
    pub error: Option<String>,
}

pub struct ModelDownloader {
    config: Arc<DownloaderConfig>,
    files: Arc<FileManager>,
    stored: Arc<StoredModelsManager>,
    tasks: Arc<DownloadTaskManager>,
    backend: Arc<dyn TransferBackend>,
    notifier: Arc<dyn DownloadNotifier>,
    events: Arc<EventEmitter<DownloaderEvent>>,
    init: OnceCell<()>,
    notifications_allowed: AtomicBool,
}

impl ModelDownloader {
    /// Open the database under `config` and wire the managers. Settings
    /// stored in the database override `config`.
    pub fn new(
        config: DownloaderConfig,
        backend: Arc<dyn TransferBackend>,
        notifier: Arc<dyn DownloadNotifier>,
    ) -> DownloadResult<Self> {
        let (config, db) = open_database(config)?;
        Ok(Self::assemble(config, db, backend, notifier))
    }

    /// HTTP transfers and log notifications
    pub fn open(config: DownloaderConfig) -> DownloadResult<Self> {
        let (config, db) = open_database(config)?;
        let backend = HttpTransferBackend::from_config(&config)
            .map_err(|e| DownloadError::Initialization(e.to_string()))?;
        Ok(Self::assemble(config, db, Arc::new(backend), Arc::new(LogNotifier)))
    }

    fn assemble(
        config: DownloaderConfig,
        db: Arc<DatabaseManager>,
        backend: Arc<dyn TransferBackend>,
        notifier: Arc<dyn DownloadNotifier>,
    ) -> Self {
        let config = Arc::new(config);
        let files = Arc::new(FileManager::new(config.models_dir.clone(), config.temp_dir.clone()));
        let stored = Arc::new(StoredModelsManager::new(files.clone(), db.clone(), config.clone()));
        let tasks = Arc::new(DownloadTaskManager::new(
            db,
            files.clone(),
            stored.clone(),
            backend.clone(),
            notifier.clone(),
            config.clone(),
        ));

        let events = Arc::new(EventEmitter::new());
        forward(files.events(), &events);
        forward(stored.events(), &events);
        forward(tasks.events(), &events);

        Self {
            config,
            files,
            stored,
            tasks,
            backend,
            notifier,
            events,
            init: OnceCell::new(),
            notifications_allowed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// `downloadProgress`, `modelsChanged` and `importProgress` from every manager
    pub fn events(&self) -> &EventEmitter<DownloaderEvent> {
        &self.events
    }

    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&DownloaderEvent) + Send + Sync + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Bring every manager up. Concurrent callers wait on the same run; a
    /// failed run is retried by the next caller.
    pub async fn initialize(&self) -> DownloadResult<()> {
        self.init
            .get_or_try_init(|| async {
                self.run_initialization().await.map_err(|e| match e {
                    DownloadError::Initialization(_) => e,
                    other => DownloadError::Initialization(other.to_string()),
                })
            })
            .await?;
        Ok(())
    }

    async fn run_initialization(&self) -> DownloadResult<()> {
        log::info!("Initializing model downloader in {}", self.config.models_dir.display());

        self.files.initialize_directories().await?;
        self.stored.initialize().await?;

        self.tasks.load().await?;
        let summary = self.tasks.reconcile().await;
        self.tasks.start_update_pump();

        self.setup_notifications();

        let completed = self.tasks.process_completed_downloads().await;
        let expired = self.tasks.expire_idle_paused().await;
        let removed = match self.files.cleanup_temp_directory(&self.tasks.active_file_names()).await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("Temp cleanup failed: {}", e);
                0
            }
        };

        log::info!(
            "Model downloader ready: {} active downloads, reconciled {:?}, {} completed, {} expired, {} temp files removed",
            self.tasks.active_tasks().len(),
            summary,
            completed,
            expired,
            removed
        );
        Ok(())
    }

    fn setup_notifications(&self) {
        let granted = self.notifier.request_permission();
        if !granted {
            log::warn!("Notification permission denied");
        }
        self.notifications_allowed.store(granted, Ordering::SeqCst);
    }

    pub async fn download_model(&self, url: &str, file_name: &str) -> DownloadResult<DownloadHandle> {
        self.initialize().await?;

        if !self.notifications_allowed.load(Ordering::SeqCst) {
            self.setup_notifications();
        }

        self.tasks.download_model(url, file_name).await
    }

    /// Download under the name the server suggests, falling back to the
    /// last path segment of `url`
    pub async fn download_from_url(&self, url: &str) -> DownloadResult<DownloadHandle> {
        let parsed = validate_url(url)?;
        self.initialize().await?;

        let file_name = match self.backend.probe_file_name(url).await {
            Some(name) => name,
            None => file_name_from_url(&parsed).ok_or_else(|| {
                DownloadError::Validation(format!("Cannot derive a file name from {}", url))
            })?,
        };
        log::info!("Downloading {} as {}", url, file_name);

        self.download_model(url, &file_name).await
    }

    pub async fn pause_download(&self, download_id: &str) -> DownloadResult<()> {
        self.initialize().await?;
        self.tasks.pause_download(download_id).await
    }

    pub async fn resume_download(&self, download_id: &str) -> DownloadResult<()> {
        self.initialize().await?;
        self.tasks.resume_download(download_id).await
    }

    pub async fn cancel_download(&self, download_id: &str) -> DownloadResult<()> {
        self.initialize().await?;
        self.tasks.cancel_download(download_id).await
    }

    pub async fn get_stored_models(&self) -> DownloadResult<Vec<StoredModel>> {
        self.initialize().await?;
        self.stored.get_stored_models().await
    }

    /// `path` is an owned model's path or a linked model's source URI
    pub async fn delete_model(&self, path: &str) -> DownloadResult<()> {
        self.initialize().await?;
        self.stored.delete_model(path).await
    }

    pub async fn link_external_model(&self, uri: &str, file_name: &str) -> DownloadResult<StoredModel> {
        self.initialize().await?;
        self.tasks.link_external_model(uri, file_name).await
    }

    /// Rescan the inventory. Returns whether it changed.
    pub async fn refresh_stored_models(&self) -> DownloadResult<bool> {
        self.initialize().await?;
        self.stored.refresh_stored_models().await
    }

    /// Converge ledger, disk and inventory with the transfer service.
    ///
    /// Safe to call at any time and any number of times; a second call with
    /// nothing new to report changes nothing and emits nothing. Bounded by
    /// the configured background budget and never returns an error.
    pub async fn check_background_downloads(&self) -> BackgroundCheckSummary {
        self.check_background_downloads_within(self.config.background_budget).await
    }

    /// `check_background_downloads` with an explicit time budget
    pub async fn check_background_downloads_within(&self, budget: Duration) -> BackgroundCheckSummary {
        let mut summary = BackgroundCheckSummary::default();

        let pass = async {
            if let Err(e) = self.initialize().await {
                log::error!("Background check could not initialize: {}", e);
                summary.error = Some(e.to_string());
                return;
            }

            summary.reconcile = self.tasks.reconcile().await;
            summary.expired_paused = self.tasks.expire_idle_paused().await;

            match self.files.cleanup_temp_directory(&self.tasks.active_file_names()).await {
                Ok(removed) => summary.temp_files_removed = removed,
                Err(e) => log::warn!("Temp cleanup failed: {}", e),
            }

            match self.stored.refresh_stored_models().await {
                Ok(changed) => summary.models_changed = changed,
                Err(e) => {
                    log::error!("Inventory refresh failed: {}", e);
                    summary.error = Some(e.to_string());
                }
            }
        };

        if tokio::time::timeout(budget, pass).await.is_err() {
            log::warn!("Background check exceeded its {:?} budget", budget);
            summary.timed_out = true;
        }

        summary.active_downloads = self.tasks.active_tasks().len();
        log::debug!("Background check: {:?}", summary);
        summary
    }

    /// Hand off finished transfers. Returns the number completed.
    pub async fn process_completed_downloads(&self) -> usize {
        if let Err(e) = self.initialize().await {
            log::error!("Cannot process completed downloads: {}", e);
            return 0;
        }
        self.tasks.process_completed_downloads().await
    }

    /// Restart downloads whose transfer was lost. Returns the number restarted.
    pub async fn ensure_downloads_are_running(&self) -> usize {
        if let Err(e) = self.initialize().await {
            log::error!("Cannot restart downloads: {}", e);
            return 0;
        }
        self.tasks.ensure_downloads_are_running().await
    }

    pub fn active_downloads(&self) -> Vec<DownloadTask> {
        self.tasks.active_tasks()
    }

    pub fn active_download_count(&self) -> usize {
        self.tasks.active_tasks().len()
    }

    /// Wait until nothing is starting or downloading. Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.tasks.wait_for_idle(timeout).await
    }

    /// Stop applying transfer updates. Transfers themselves keep running and
    /// are picked up by the next initialization.
    pub fn shutdown(&self) {
        log::info!("Shutting down model downloader");
        self.tasks.shutdown();
    }
}

fn open_database(mut config: DownloaderConfig) -> DownloadResult<(DownloaderConfig, Arc<DatabaseManager>)> {
    let db = DatabaseManager::new(config.database_path.clone())
        .map_err(|e| DownloadError::Initialization(format!("{:#}", e)))?;
    config.apply_settings(&db);
    Ok((config, Arc::new(db)))
}

fn forward(source: &EventEmitter<DownloaderEvent>, target: &Arc<EventEmitter<DownloaderEvent>>) {
    for name in [DOWNLOAD_PROGRESS, MODELS_CHANGED, IMPORT_PROGRESS] {
        let target = Arc::clone(target);
        source.on(name, move |event| {
            target.emit(event);
        });
    }
}

/// Make `downloader` the process-wide instance. Returns false if one is
/// already installed.
pub fn install(downloader: Arc<ModelDownloader>) -> bool {
    INSTANCE.set(downloader).is_ok()
}

pub fn instance() -> Option<Arc<ModelDownloader>> {
    INSTANCE.get().cloned()
}

/// The installed instance, or one opened in the default data directory
pub fn global() -> DownloadResult<Arc<ModelDownloader>> {
    INSTANCE
        .get_or_try_init(|| ModelDownloader::open(DownloaderConfig::with_defaults()).map(Arc::new))
        .cloned()
}
