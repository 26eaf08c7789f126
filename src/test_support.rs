// Shared test fixtures: a scripted transfer backend, event recording and config helpers

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DownloaderConfig;
use crate::events::{
    DownloadProgressEvent, DownloaderEvent, EventEmitter, DOWNLOAD_PROGRESS, IMPORT_PROGRESS,
    MODELS_CHANGED,
};
use crate::notifications::DownloadNotifier;
use crate::transfer::{
    TransferBackend, TransferError, TransferEvent, TransferRequest, TransferState, TransferUpdate,
    UpdateSink,
};

/// Config rooted at `root/data` with instant flushing and short timeouts
pub fn test_config(root: &Path) -> DownloaderConfig {
    let mut config = DownloaderConfig::new(root.join("data"));
    config.ledger_flush_interval = Duration::ZERO;
    config.query_timeout = Duration::from_millis(500);
    config.background_budget = Duration::from_secs(5);
    config.volatile_source_dirs = vec![root.join("volatile")];
    config
}

/// Backend whose transfers only move when the test says so
#[derive(Default)]
pub struct ScriptedBackend {
    sink: Mutex<Option<UpdateSink>>,
    states: Mutex<HashMap<String, TransferState>>,
    live: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    refuse_start: AtomicBool,
    query_delay: Mutex<Option<Duration>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an update as if the transfer produced it
    pub fn push(&self, download_id: &str, event: TransferEvent) {
        match &event {
            TransferEvent::Progress { bytes_downloaded, total_bytes } => {
                self.set_state(
                    download_id,
                    TransferState::Active {
                        bytes_downloaded: *bytes_downloaded,
                        total_bytes: *total_bytes,
                    },
                );
            }
            TransferEvent::Finished { total_bytes } => {
                self.set_state(download_id, TransferState::Finished { total_bytes: *total_bytes });
            }
            TransferEvent::Failed { reason } => {
                self.set_state(download_id, TransferState::Failed { reason: reason.clone() });
            }
        }

        let sink = self.sink.lock().unwrap();
        sink.as_ref()
            .expect("backend not attached")
            .send(TransferUpdate {
                download_id: download_id.to_string(),
                event,
            })
            .unwrap();
    }

    pub fn set_state(&self, download_id: &str, state: TransferState) {
        self.states.lock().unwrap().insert(download_id.to_string(), state);
    }

    pub fn refuse_next_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn delay_queries(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn require_live(&self, download_id: &str) -> Result<(), TransferError> {
        if self.live.lock().unwrap().contains(download_id) {
            Ok(())
        } else {
            Err(TransferError::UnknownTransfer(download_id.to_string()))
        }
    }
}

#[async_trait]
impl TransferBackend for ScriptedBackend {
    fn attach(&self, sink: UpdateSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn start(&self, request: TransferRequest) -> Result<(), TransferError> {
        if self.refuse_start.swap(false, Ordering::SeqCst) {
            return Err(TransferError::Request("connection refused".to_string()));
        }
        self.record(format!("start:{}:{}", request.download_id, request.resume_from));
        self.live.lock().unwrap().insert(request.download_id.clone());
        self.set_state(
            &request.download_id,
            TransferState::Active {
                bytes_downloaded: request.resume_from,
                total_bytes: 0,
            },
        );
        Ok(())
    }

    async fn pause(&self, download_id: &str) -> Result<(), TransferError> {
        self.require_live(download_id)?;
        self.record(format!("pause:{}", download_id));
        let mut states = self.states.lock().unwrap();
        if let Some(TransferState::Active { bytes_downloaded, total_bytes }) = states.get(download_id).cloned() {
            states.insert(
                download_id.to_string(),
                TransferState::Paused { bytes_downloaded, total_bytes },
            );
        }
        Ok(())
    }

    async fn resume(&self, download_id: &str) -> Result<(), TransferError> {
        self.require_live(download_id)?;
        self.record(format!("resume:{}", download_id));
        let mut states = self.states.lock().unwrap();
        if let Some(TransferState::Paused { bytes_downloaded, total_bytes }) = states.get(download_id).cloned() {
            states.insert(
                download_id.to_string(),
                TransferState::Active { bytes_downloaded, total_bytes },
            );
        }
        Ok(())
    }

    async fn cancel(&self, download_id: &str) -> Result<(), TransferError> {
        self.record(format!("cancel:{}", download_id));
        self.states.lock().unwrap().remove(download_id);
        if self.live.lock().unwrap().remove(download_id) {
            Ok(())
        } else {
            Err(TransferError::UnknownTransfer(download_id.to_string()))
        }
    }

    fn release(&self, download_id: &str) {
        self.record(format!("release:{}", download_id));
        self.live.lock().unwrap().remove(download_id);
        self.states.lock().unwrap().remove(download_id);
    }

    async fn query(&self, download_id: &str, destination: &Path) -> TransferState {
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let known = self.states.lock().unwrap().get(download_id).cloned();
        if let Some(state) = known {
            return state;
        }
        match std::fs::metadata(destination) {
            Ok(metadata) => TransferState::Interrupted {
                bytes_on_disk: metadata.len(),
            },
            Err(_) => TransferState::Gone,
        }
    }

    async fn probe_file_name(&self, url: &str) -> Option<String> {
        self.record(format!("probe:{}", url));
        None
    }
}

/// Counts calls; permission can be denied
#[derive(Default)]
pub struct CountingNotifier {
    pub permission_requests: AtomicUsize,
    pub deny: AtomicBool,
    pub completed: Mutex<Vec<String>>,
    pub failed: Mutex<Vec<String>>,
}

impl DownloadNotifier for CountingNotifier {
    fn request_permission(&self) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        !self.deny.load(Ordering::SeqCst)
    }

    fn download_progress(&self, _model_name: &str, _progress: u8) {}

    fn download_completed(&self, model_name: &str) {
        self.completed.lock().unwrap().push(model_name.to_string());
    }

    fn download_failed(&self, model_name: &str, _reason: &str) {
        self.failed.lock().unwrap().push(model_name.to_string());
    }

    fn dismiss(&self, _model_name: &str) {}
}

/// Everything an emitter published, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<DownloaderEvent>>>,
}

impl EventLog {
    pub fn attach(emitter: &EventEmitter<DownloaderEvent>) -> Self {
        let log = Self::default();
        log.listen(emitter);
        log
    }

    /// Also record `emitter`, interleaved with what is already recorded
    pub fn listen(&self, emitter: &EventEmitter<DownloaderEvent>) {
        for name in [DOWNLOAD_PROGRESS, MODELS_CHANGED, IMPORT_PROGRESS] {
            let events = self.events.clone();
            emitter.on(name, move |event| events.lock().unwrap().push(event.clone()));
        }
    }

    pub fn all(&self) -> Vec<DownloaderEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn progress(&self) -> Vec<DownloadProgressEvent> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                DownloaderEvent::DownloadProgress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn models_changed(&self) -> usize {
        self.all()
            .iter()
            .filter(|e| matches!(e, DownloaderEvent::ModelsChanged))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Poll `condition` until it holds; panics after five seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn write_file(path: &PathBuf, len: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, vec![0xAB; len]).unwrap();
}
