//! StoredModelsManager - owned files and linked registry merged into one inventory

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::types::{ModelSource, StoredModel};
use crate::config::DownloaderConfig;
use crate::database::{DatabaseManager, ExternalLink};
use crate::error::{DownloadError, DownloadResult};
use crate::events::{DownloaderEvent, EventEmitter};
use crate::files::FileManager;
use crate::naming::{normalized_base_name, validate_file_name};

pub struct StoredModelsManager {
    files: Arc<FileManager>,
    db: Arc<DatabaseManager>,
    config: Arc<DownloaderConfig>,
    cache: RwLock<Vec<StoredModel>>,
    /// Serializes inventory mutations
    write_lock: Mutex<()>,
    events: EventEmitter<DownloaderEvent>,
}

impl StoredModelsManager {
    pub fn new(files: Arc<FileManager>, db: Arc<DatabaseManager>, config: Arc<DownloaderConfig>) -> Self {
        Self {
            files,
            db,
            config,
            cache: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            events: EventEmitter::new(),
        }
    }

    /// Emits `modelsChanged`
    pub fn events(&self) -> &EventEmitter<DownloaderEvent> {
        &self.events
    }

    /// Load the inventory into the cache
    pub async fn initialize(&self) -> DownloadResult<()> {
        let models = self.scan().await?;
        log::info!("Loaded {} stored models", models.len());
        *self.cache.write().await = models;
        Ok(())
    }

    /// Inventory as of the last scan, without touching the disk
    pub async fn cached_models(&self) -> Vec<StoredModel> {
        self.cache.read().await.clone()
    }

    /// Fresh inventory, sorted by display name
    pub async fn get_stored_models(&self) -> DownloadResult<Vec<StoredModel>> {
        let models = self.scan().await?;
        *self.cache.write().await = models.clone();
        Ok(models)
    }

    /// Stored model that would collide with `file_name`
    pub async fn find_conflict(&self, file_name: &str) -> DownloadResult<Option<StoredModel>> {
        let wanted = normalized_base_name(file_name);
        let models = self.scan().await?;
        Ok(models
            .into_iter()
            .find(|m| normalized_base_name(&m.display_name) == wanted))
    }

    /// Record a finished download. The file must already be in the models directory.
    pub async fn register_downloaded(&self, file_name: &str) -> DownloadResult<StoredModel> {
        let _guard = self.write_lock.lock().await;

        let path = self.files.model_path(file_name);
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| DownloadError::io("Downloaded model is missing", e))?;
        if !metadata.is_file() {
            return Err(DownloadError::Filesystem(format!("{} is not a file", path.display())));
        }

        let models = self.scan().await?;
        let model = models
            .iter()
            .find(|m| matches!(&m.source, ModelSource::Owned { path: p, .. } if *p == path))
            .cloned()
            .ok_or_else(|| DownloadError::Filesystem(format!("{} is not a recognised model", file_name)))?;

        *self.cache.write().await = models;
        log::info!("Registered downloaded model {} ({} bytes)", file_name, model.size_bytes());
        self.events.emit(&DownloaderEvent::ModelsChanged);
        Ok(model)
    }

    /// Delete by owned path or linked source URI. Linked sources are left alone.
    pub async fn delete_model(&self, path: &str) -> DownloadResult<()> {
        let _guard = self.write_lock.lock().await;

        let models = self.scan().await?;
        let target = models
            .iter()
            .find(|m| match &m.source {
                ModelSource::Owned { path: owned, .. } => owned.as_path() == Path::new(path),
                ModelSource::Linked { source_uri, .. } => source_uri == path,
            })
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(format!("No stored model at {}", path)))?;

        match &target.source {
            ModelSource::Owned { path, .. } => {
                fs::remove_file(path)
                    .await
                    .map_err(|e| DownloadError::io("Failed to delete model file", e))?;
                log::info!("Deleted model file {}", path.display());
            }
            ModelSource::Linked { source_uri, .. } => {
                self.db.delete_external_link(&target.display_name)?;
                log::info!("Unlinked {} (source {} kept)", target.display_name, source_uri);
            }
        }

        let models = self.scan().await?;
        *self.cache.write().await = models;
        self.events.emit(&DownloaderEvent::ModelsChanged);
        Ok(())
    }

    /// Make an external file available as `file_name`. Files in volatile
    /// locations are imported; everything else is linked in place.
    pub async fn link_external_model(&self, uri: &str, file_name: &str) -> DownloadResult<StoredModel> {
        validate_file_name(file_name, &self.config.allowed_extensions)?;
        let source = resolve_local_path(uri)
            .ok_or_else(|| DownloadError::Validation(format!("Unsupported model location: {}", uri)))?;

        let _guard = self.write_lock.lock().await;

        let metadata = fs::metadata(&source)
            .await
            .map_err(|e| DownloadError::io("Cannot access linked model", e))?;
        if !metadata.is_file() {
            return Err(DownloadError::Filesystem(format!("{} is not a file", source.display())));
        }
        // Readability check; the handle is dropped straight away
        fs::File::open(&source)
            .await
            .map_err(|e| DownloadError::io("Cannot read linked model", e))?;

        if let Some(existing) = self.find_conflict(file_name).await? {
            return Err(DownloadError::Conflict(format!(
                "{} conflicts with stored model {}",
                file_name, existing.display_name
            )));
        }

        if self.config.is_volatile_source(&source) {
            log::info!("{} is in a volatile location, importing instead of linking", source.display());
            self.files.import_external_file(&source, file_name).await?;
        } else {
            let link = ExternalLink {
                name: file_name.to_string(),
                source_uri: uri.to_string(),
                size_bytes: metadata.len(),
                linked_at: Utc::now(),
            };
            self.db.insert_external_link(&link)?;
            log::info!("Linked {} -> {}", file_name, uri);
        }

        let models = self.scan().await?;
        let wanted = normalized_base_name(file_name);
        let model = models
            .iter()
            .find(|m| normalized_base_name(&m.display_name) == wanted)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound(format!("{} vanished after linking", file_name)))?;

        *self.cache.write().await = models;
        self.events.emit(&DownloaderEvent::ModelsChanged);
        Ok(model)
    }

    /// Rescan and emit `modelsChanged` only when something changed.
    /// Returns whether it did.
    pub async fn refresh_stored_models(&self) -> DownloadResult<bool> {
        let models = self.scan().await?;
        let changed = {
            let mut cache = self.cache.write().await;
            if *cache == models {
                false
            } else {
                *cache = models;
                true
            }
        };

        if changed {
            log::debug!("Stored models changed on refresh");
            self.events.emit(&DownloaderEvent::ModelsChanged);
        }
        Ok(changed)
    }

    async fn scan(&self) -> DownloadResult<Vec<StoredModel>> {
        let mut models = self.scan_owned().await?;
        let mut seen: HashSet<String> = models
            .iter()
            .map(|m| normalized_base_name(&m.display_name))
            .collect();

        for link in self.db.list_external_links()? {
            let base = normalized_base_name(&link.name);
            if !seen.insert(base) {
                log::debug!("Linked model {} shadowed by another entry", link.name);
                continue;
            }

            let size_bytes = self.linked_size(&link).await;
            models.push(StoredModel {
                display_name: link.name,
                added_at: link.linked_at,
                source: ModelSource::Linked {
                    source_uri: link.source_uri,
                    size_bytes,
                },
            });
        }

        models.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        Ok(models)
    }

    async fn scan_owned(&self) -> DownloadResult<Vec<StoredModel>> {
        let mut entries = match fs::read_dir(self.files.models_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DownloadError::io("Failed to read models directory", e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::io("Failed to read models directory", e))?
        {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !self.config.has_allowed_extension(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            let added_at: DateTime<Utc> = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            found.push(StoredModel {
                display_name: name,
                added_at,
                source: ModelSource::Owned {
                    path: entry.path(),
                    size_bytes: metadata.len(),
                },
            });
        }

        // Owned duplicates (case variants) keep the first name in sort order
        found.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        let mut seen = HashSet::new();
        found.retain(|m| seen.insert(normalized_base_name(&m.display_name)));
        Ok(found)
    }

    /// Current size when the source is reachable, otherwise the last known one
    async fn linked_size(&self, link: &ExternalLink) -> u64 {
        let Some(path) = resolve_local_path(&link.source_uri) else {
            return link.size_bytes;
        };

        match fs::metadata(&path).await {
            Ok(metadata) => {
                let size = metadata.len();
                if size != link.size_bytes {
                    if let Err(e) = self.db.update_external_link_size(&link.name, size) {
                        log::warn!("Failed to record new size of {}: {:#}", link.name, e);
                    }
                }
                size
            }
            Err(_) => link.size_bytes,
        }
    }
}

/// Absolute paths and `file://` URIs map to local paths; anything else is unsupported
pub fn resolve_local_path(uri: &str) -> Option<PathBuf> {
    if uri.starts_with("file://") {
        return reqwest::Url::parse(uri).ok()?.to_file_path().ok();
    }
    let path = PathBuf::from(uri);
    if path.is_absolute() {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        manager: StoredModelsManager,
        changes: Arc<AtomicUsize>,
    }

    async fn create_manager() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut config = DownloaderConfig::new(root.join("data"));
        // Keep tempdir-based sources linkable
        config.volatile_source_dirs = vec![root.join("volatile")];
        let config = Arc::new(config);

        let files = Arc::new(FileManager::new(config.models_dir.clone(), config.temp_dir.clone()));
        files.initialize_directories().await.unwrap();
        std::fs::create_dir_all(root.join("external")).unwrap();
        std::fs::create_dir_all(root.join("volatile")).unwrap();

        let db = Arc::new(DatabaseManager::open_in_memory().unwrap());
        let manager = StoredModelsManager::new(files, db, config);
        manager.initialize().await.unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        {
            let changes = changes.clone();
            manager.events().on(crate::events::MODELS_CHANGED, move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            });
        }

        Fixture { _dir: dir, root, manager, changes }
    }

    fn write_external(fx: &Fixture, name: &str, len: usize) -> PathBuf {
        let path = fx.root.join("external").join(name);
        std::fs::write(&path, vec![1u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_lists_owned_and_linked_sorted() {
        let fx = create_manager().await;
        std::fs::write(fx.manager.files.model_path("b.gguf"), b"bb").unwrap();
        std::fs::write(fx.manager.files.model_path("notes.txt"), b"ignored").unwrap();
        let external = write_external(&fx, "a.gguf", 3);

        fx.manager
            .link_external_model(external.to_str().unwrap(), "a.gguf")
            .await
            .unwrap();

        let models = fx.manager.get_stored_models().await.unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.display_name.as_str()).collect();
        assert_eq!(names, vec!["a.gguf", "b.gguf"]);
        assert!(models[0].is_linked());
        assert_eq!(models[0].size_bytes(), 3);
        assert_eq!(models[1].size_bytes(), 2);
    }

    #[tokio::test]
    async fn test_link_conflicts_with_owned_and_linked() {
        let fx = create_manager().await;
        std::fs::write(fx.manager.files.model_path("model.gguf"), b"owned").unwrap();
        let external = write_external(&fx, "Model.GGUF", 10);

        let err = fx
            .manager
            .link_external_model(external.to_str().unwrap(), "Model.GGUF")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Conflict(_)));
        assert!(fx.manager.db.list_external_links().unwrap().is_empty());

        let other = write_external(&fx, "phi.gguf", 10);
        fx.manager.link_external_model(other.to_str().unwrap(), "phi.gguf").await.unwrap();
        let err = fx
            .manager
            .link_external_model(other.to_str().unwrap(), "PHI.gguf")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Conflict(_)));
        assert_eq!(fx.manager.db.list_external_links().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_link_rejects_bad_input() {
        let fx = create_manager().await;

        let err = fx.manager.link_external_model("content://media/1", "m.gguf").await.unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        let err = fx.manager.link_external_model("relative/m.gguf", "m.gguf").await.unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        let missing = fx.root.join("external").join("missing.gguf");
        let err = fx
            .manager
            .link_external_model(missing.to_str().unwrap(), "missing.gguf")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Filesystem(_)));
        assert_eq!(fx.changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_link_accepts_file_uri() {
        let fx = create_manager().await;
        let external = write_external(&fx, "uri.gguf", 5);
        let uri = reqwest::Url::from_file_path(&external).unwrap().to_string();

        let model = fx.manager.link_external_model(&uri, "uri.gguf").await.unwrap();
        assert_eq!(model.location(), uri);
        assert_eq!(model.size_bytes(), 5);
    }

    #[tokio::test]
    async fn test_volatile_source_is_imported() {
        let fx = create_manager().await;
        let picked = fx.root.join("volatile").join("picked.gguf");
        std::fs::write(&picked, vec![9u8; 64]).unwrap();

        let model = fx
            .manager
            .link_external_model(picked.to_str().unwrap(), "picked.gguf")
            .await
            .unwrap();

        assert!(!model.is_linked());
        assert!(fx.manager.files.model_path("picked.gguf").exists());
        assert!(fx.manager.db.list_external_links().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_linked_keeps_source() {
        let fx = create_manager().await;
        let external = write_external(&fx, "keep.gguf", 4);
        fx.manager.link_external_model(external.to_str().unwrap(), "keep.gguf").await.unwrap();

        fx.manager.delete_model(external.to_str().unwrap()).await.unwrap();

        assert!(external.exists());
        assert!(fx.manager.get_stored_models().await.unwrap().is_empty());
        assert_eq!(fx.changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_owned_removes_file() {
        let fx = create_manager().await;
        let path = fx.manager.files.model_path("gone.gguf");
        std::fs::write(&path, b"x").unwrap();

        fx.manager.delete_model(path.to_str().unwrap()).await.unwrap();
        assert!(!path.exists());
        assert_eq!(fx.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_path_is_not_found() {
        let fx = create_manager().await;
        let stray = fx.root.join("external").join("stray.gguf");
        std::fs::write(&stray, b"x").unwrap();

        let err = fx.manager.delete_model(stray.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn test_refresh_only_emits_on_change() {
        let fx = create_manager().await;

        assert!(!fx.manager.refresh_stored_models().await.unwrap());
        assert_eq!(fx.changes.load(Ordering::SeqCst), 0);

        std::fs::write(fx.manager.files.model_path("new.gguf"), b"x").unwrap();
        assert!(fx.manager.refresh_stored_models().await.unwrap());
        assert!(!fx.manager.refresh_stored_models().await.unwrap());
        assert_eq!(fx.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_downloaded() {
        let fx = create_manager().await;
        assert!(fx.manager.register_downloaded("late.gguf").await.is_err());

        std::fs::write(fx.manager.files.model_path("late.gguf"), vec![0u8; 16]).unwrap();
        let model = fx.manager.register_downloaded("late.gguf").await.unwrap();
        assert_eq!(model.size_bytes(), 16);
        assert_eq!(fx.manager.cached_models().await.len(), 1);
        assert_eq!(fx.changes.load(Ordering::SeqCst), 1);
    }
}
