//! In-process transfer backend on top of reqwest.
//!
//! Each transfer is a tokio task streaming into the destination file. Resume
//! uses HTTP Range requests; servers that ignore the range get a fresh
//! download instead of a corrupted append.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    TransferBackend, TransferError, TransferEvent, TransferRequest, TransferState, TransferUpdate,
    UpdateSink,
};
use crate::config::DownloaderConfig;
use crate::naming::file_name_from_content_disposition;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
enum Phase {
    Running,
    Paused,
    Finished { total_bytes: u64 },
    Failed { reason: String },
}

struct Slot {
    request: TransferRequest,
    phase: Phase,
    /// Distinguishes the current worker from ones that were paused or replaced
    generation: u64,
    token: CancellationToken,
    worker: Option<JoinHandle<()>>,
    bytes_downloaded: u64,
    total_bytes: u64,
}

#[derive(Clone)]
struct Shared {
    slots: Arc<DashMap<String, Slot>>,
    sink: Arc<RwLock<Option<UpdateSink>>>,
}

impl Shared {
    fn send(&self, download_id: &str, event: TransferEvent) {
        let guard = match self.sink.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(sink) => {
                let update = TransferUpdate {
                    download_id: download_id.to_string(),
                    event,
                };
                if sink.send(update).is_err() {
                    log::debug!("Update for {} dropped, receiver closed", download_id);
                }
            }
            None => log::debug!("Update for {} dropped, no sink attached", download_id),
        }
    }

    /// Apply `f` to the slot if it still belongs to `generation`
    fn update<F: FnOnce(&mut Slot)>(&self, download_id: &str, generation: u64, f: F) -> bool {
        match self.slots.get_mut(download_id) {
            Some(mut slot) if slot.generation == generation => {
                f(&mut slot);
                true
            }
            _ => false,
        }
    }
}

pub struct HttpTransferBackend {
    client: reqwest::Client,
    stall_timeout: Duration,
    shared: Shared,
    generations: AtomicU64,
}

impl HttpTransferBackend {
    pub fn new(connect_timeout: Duration, stall_timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("model-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            stall_timeout,
            shared: Shared {
                slots: Arc::new(DashMap::new()),
                sink: Arc::new(RwLock::new(None)),
            },
            generations: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &DownloaderConfig) -> Result<Self, TransferError> {
        Self::new(config.connect_timeout, config.stall_timeout)
    }

    fn spawn_worker(&self, request: TransferRequest, file: File, offset: u64, known_total: u64) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let download_id = request.download_id.clone();

        let worker = Worker {
            client: self.client.clone(),
            shared: self.shared.clone(),
            stall_timeout: self.stall_timeout,
            generation,
            token: token.clone(),
            request: request.clone(),
        };

        self.shared.slots.insert(
            download_id.clone(),
            Slot {
                request,
                phase: Phase::Running,
                generation,
                token,
                worker: None,
                bytes_downloaded: offset,
                total_bytes: known_total,
            },
        );

        let handle = tokio::spawn(worker.run(file, offset));
        self.shared.update(&download_id, generation, |slot| slot.worker = Some(handle));
    }
}

#[async_trait]
impl TransferBackend for HttpTransferBackend {
    fn attach(&self, sink: UpdateSink) {
        let mut guard = match self.shared.sink.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(sink);
    }

    async fn start(&self, request: TransferRequest) -> Result<(), TransferError> {
        if let Some(slot) = self.shared.slots.get(&request.download_id) {
            if matches!(slot.phase, Phase::Running | Phase::Paused) {
                return Err(TransferError::Request(format!(
                    "{} is already in progress",
                    request.download_id
                )));
            }
        }

        let (file, offset) = open_destination(&request.destination, request.resume_from).await?;
        log::info!(
            "Starting transfer {} from {} at offset {}",
            request.download_id,
            request.url,
            offset
        );
        self.spawn_worker(request, file, offset, 0);
        Ok(())
    }

    async fn pause(&self, download_id: &str) -> Result<(), TransferError> {
        let worker = {
            let mut slot = self
                .shared
                .slots
                .get_mut(download_id)
                .ok_or_else(|| TransferError::UnknownTransfer(download_id.to_string()))?;
            if !matches!(slot.phase, Phase::Running) {
                return Err(TransferError::Request(format!("{} is not running", download_id)));
            }
            slot.phase = Phase::Paused;
            slot.token.cancel();
            slot.worker.take()
        };

        // Wait for the file to be flushed so the partial size is accurate
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        log::info!("Paused transfer {}", download_id);
        Ok(())
    }

    async fn resume(&self, download_id: &str) -> Result<(), TransferError> {
        let (request, total) = {
            let slot = self
                .shared
                .slots
                .get(download_id)
                .ok_or_else(|| TransferError::UnknownTransfer(download_id.to_string()))?;
            match slot.phase {
                Phase::Paused => {}
                Phase::Running => return Ok(()),
                _ => {
                    return Err(TransferError::Request(format!(
                        "{} can no longer be resumed",
                        download_id
                    )))
                }
            }
            (slot.request.clone(), slot.total_bytes)
        };

        let on_disk = fs::metadata(&request.destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let (file, offset) = open_destination(&request.destination, on_disk).await?;
        log::info!("Resuming transfer {} at offset {}", download_id, offset);

        self.spawn_worker(
            TransferRequest {
                resume_from: offset,
                ..request
            },
            file,
            offset,
            total,
        );
        Ok(())
    }

    async fn cancel(&self, download_id: &str) -> Result<(), TransferError> {
        let (_, slot) = self
            .shared
            .slots
            .remove(download_id)
            .ok_or_else(|| TransferError::UnknownTransfer(download_id.to_string()))?;

        slot.token.cancel();
        if let Some(worker) = slot.worker {
            let _ = worker.await;
        }
        log::info!("Cancelled transfer {}", download_id);
        Ok(())
    }

    fn release(&self, download_id: &str) {
        if let Some((_, slot)) = self.shared.slots.remove(download_id) {
            slot.token.cancel();
        }
    }

    async fn query(&self, download_id: &str, destination: &Path) -> TransferState {
        if let Some(slot) = self.shared.slots.get(download_id) {
            return match &slot.phase {
                Phase::Running => TransferState::Active {
                    bytes_downloaded: slot.bytes_downloaded,
                    total_bytes: slot.total_bytes,
                },
                Phase::Paused => TransferState::Paused {
                    bytes_downloaded: slot.bytes_downloaded,
                    total_bytes: slot.total_bytes,
                },
                Phase::Finished { total_bytes } => TransferState::Finished {
                    total_bytes: *total_bytes,
                },
                Phase::Failed { reason } => TransferState::Failed {
                    reason: reason.clone(),
                },
            };
        }

        match fs::metadata(destination).await {
            Ok(metadata) if metadata.is_file() => TransferState::Interrupted {
                bytes_on_disk: metadata.len(),
            },
            _ => TransferState::Gone,
        }
    }

    async fn probe_file_name(&self, url: &str) -> Option<String> {
        let response = tokio::time::timeout(self.stall_timeout, self.client.head(url).send())
            .await
            .ok()?
            .ok()?;
        let header = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
        file_name_from_content_disposition(header)
    }
}

enum Outcome {
    Finished(u64),
    Stopped,
}

struct Worker {
    client: reqwest::Client,
    shared: Shared,
    stall_timeout: Duration,
    generation: u64,
    token: CancellationToken,
    request: TransferRequest,
}

impl Worker {
    async fn run(self, mut file: File, offset: u64) {
        let download_id = self.request.download_id.clone();
        let outcome = self.transfer(&mut file, offset).await;

        if let Err(e) = file.flush().await {
            log::warn!("Failed to flush {}: {}", self.request.destination.display(), e);
        }
        drop(file);

        match outcome {
            Ok(Outcome::Finished(total_bytes)) => {
                let current = self.shared.update(&download_id, self.generation, |slot| {
                    slot.phase = Phase::Finished { total_bytes };
                    slot.bytes_downloaded = total_bytes;
                    slot.total_bytes = total_bytes;
                });
                if current {
                    log::info!("Transfer {} finished ({} bytes)", download_id, total_bytes);
                    self.shared.send(&download_id, TransferEvent::Finished { total_bytes });
                }
            }
            Ok(Outcome::Stopped) => {
                log::debug!("Transfer {} stopped", download_id);
            }
            Err(_) if self.token.is_cancelled() => {
                log::debug!("Transfer {} stopped while failing", download_id);
            }
            Err(reason) => {
                let current = self.shared.update(&download_id, self.generation, |slot| {
                    slot.phase = Phase::Failed {
                        reason: reason.clone(),
                    };
                });
                if current {
                    log::error!("Transfer {} failed: {}", download_id, reason);
                    self.shared.send(&download_id, TransferEvent::Failed { reason });
                }
            }
        }
    }

    async fn transfer(&self, file: &mut File, mut offset: u64) -> Result<Outcome, String> {
        let download_id = &self.request.download_id;

        let response = match self.send(offset).await? {
            Some(response) => response,
            None => return Ok(Outcome::Stopped),
        };
        let status = response.status();

        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Everything was already on disk
            if content_range_total(&response) == Some(offset) {
                file.sync_all().await.map_err(|e| format!("Failed to sync file: {}", e))?;
                return Ok(Outcome::Finished(offset));
            }
            return Err(format!("HTTP {}", status));
        }

        if offset > 0 && status == StatusCode::OK {
            log::warn!(
                "Server ignored range request for {}, restarting from zero",
                download_id
            );
            file.set_len(0).await.map_err(|e| format!("Failed to truncate file: {}", e))?;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| format!("Failed to rewind file: {}", e))?;
            offset = 0;
        }

        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        let total_bytes = if status == StatusCode::PARTIAL_CONTENT {
            content_range_total(&response)
                .unwrap_or_else(|| offset + response.content_length().unwrap_or(0))
        } else {
            response.content_length().unwrap_or(0)
        };

        self.shared.update(download_id, self.generation, |slot| {
            slot.bytes_downloaded = offset;
            slot.total_bytes = total_bytes;
        });
        self.shared.send(
            download_id,
            TransferEvent::Progress {
                bytes_downloaded: offset,
                total_bytes,
            },
        );

        let mut downloaded = offset;
        let mut stream = response.bytes_stream();
        let mut last_sent = Instant::now();

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(Outcome::Stopped),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(format!(
                        "No data received for {} seconds",
                        self.stall_timeout.as_secs()
                    ))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(format!("Download error: {}", e)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| format!("Failed to write chunk: {}", e))?;
            downloaded += chunk.len() as u64;

            self.shared.update(download_id, self.generation, |slot| {
                slot.bytes_downloaded = downloaded;
            });

            if last_sent.elapsed() >= PROGRESS_INTERVAL {
                self.shared.send(
                    download_id,
                    TransferEvent::Progress {
                        bytes_downloaded: downloaded,
                        total_bytes,
                    },
                );
                last_sent = Instant::now();
            }
        }

        if total_bytes > 0 && downloaded < total_bytes {
            return Err(format!(
                "Connection closed after {} of {} bytes",
                downloaded, total_bytes
            ));
        }

        file.flush().await.map_err(|e| format!("Failed to flush file: {}", e))?;
        file.sync_all().await.map_err(|e| format!("Failed to sync file: {}", e))?;

        self.shared.send(
            download_id,
            TransferEvent::Progress {
                bytes_downloaded: downloaded,
                total_bytes: total_bytes.max(downloaded),
            },
        );
        Ok(Outcome::Finished(downloaded))
    }

    /// `None` when cancelled before the server answered
    async fn send(&self, offset: u64) -> Result<Option<reqwest::Response>, String> {
        let mut request = self.client.get(&self.request.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        tokio::select! {
            _ = self.token.cancelled() => Ok(None),
            result = tokio::time::timeout(self.stall_timeout, request.send()) => match result {
                Err(_) => Err("Timed out waiting for the server".to_string()),
                Ok(Err(e)) => Err(format!("Failed to start download: {}", e)),
                Ok(Ok(response)) => Ok(Some(response)),
            },
        }
    }
}

/// Open the partial file positioned at `min(resume_from, size on disk)`
async fn open_destination(path: &Path, resume_from: u64) -> Result<(File, u64), TransferError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .await?;
    let on_disk = file.metadata().await?.len();
    let offset = resume_from.min(on_disk);
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok((file, offset))
}

/// Total size from `Content-Range: bytes a-b/total`
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit('/').next()?.trim().parse().ok()
}
