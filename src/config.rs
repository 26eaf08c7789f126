//! Downloader configuration
//!
//! Built-in defaults, optionally overridden from the `settings` table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::DatabaseManager;

const DEFAULT_LEDGER_FLUSH: Duration = Duration::from_secs(2);
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BACKGROUND_BUDGET: Duration = Duration::from_secs(25);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PAUSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Durable storage for finished models
    pub models_dir: PathBuf,
    /// Partial downloads and in-flight imports
    pub temp_dir: PathBuf,
    pub database_path: PathBuf,
    /// Lowercase, without the leading dot
    pub allowed_extensions: Vec<String>,
    /// Longest a progress change may go unpersisted
    pub ledger_flush_interval: Duration,
    /// Per-task bound on transfer queries during reconciliation
    pub query_timeout: Duration,
    /// Total bound on one background pass
    pub background_budget: Duration,
    pub connect_timeout: Duration,
    /// Abort a transfer when no bytes arrive for this long
    pub stall_timeout: Duration,
    /// Paused downloads idle longer than this are reclaimed. `None` keeps them forever.
    pub paused_ttl: Option<Duration>,
    /// Linking a file under one of these imports it instead
    pub volatile_source_dirs: Vec<PathBuf>,
}

impl DownloaderConfig {
    /// Standard layout under `data_dir`: `models/`, `tmp/` and `downloader.db`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let temp_dir = data_dir.join("tmp");

        Self {
            models_dir: data_dir.join("models"),
            temp_dir: temp_dir.clone(),
            database_path: data_dir.join("downloader.db"),
            allowed_extensions: vec!["gguf".to_string()],
            ledger_flush_interval: DEFAULT_LEDGER_FLUSH,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            background_budget: DEFAULT_BACKGROUND_BUDGET,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            paused_ttl: Some(DEFAULT_PAUSED_TTL),
            volatile_source_dirs: vec![std::env::temp_dir(), temp_dir],
        }
    }

    /// Config rooted at the platform data directory
    pub fn with_defaults() -> Self {
        Self::new(default_data_dir())
    }

    /// Apply overrides stored in the settings table. Unreadable settings keep the defaults.
    pub fn apply_settings(&mut self, db: &DatabaseManager) {
        let settings = match db.load_download_settings() {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Failed to load download settings, using defaults: {:#}", e);
                return;
            }
        };

        if let Some(ms) = settings.ledger_flush_ms {
            self.ledger_flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.query_timeout_ms {
            self.query_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = settings.background_budget_secs {
            self.background_budget = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = settings.stall_timeout_secs {
            self.stall_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(hours) = settings.paused_ttl_hours {
            self.paused_ttl = if hours == 0 {
                None
            } else {
                Some(Duration::from_secs(hours * 60 * 60))
            };
        }

        log::debug!("Downloader config after overrides: {:?}", self);
    }

    /// Whether `file_name` carries one of the allowed extensions (case-insensitive)
    pub fn has_allowed_extension(&self, file_name: &str) -> bool {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_lowercase();
                self.allowed_extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }

    pub fn is_volatile_source(&self, path: &Path) -> bool {
        self.volatile_source_dirs.iter().any(|dir| path.starts_with(dir))
    }
}

/// `<platform data dir>/model-downloader`, falling back to the working directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("model-downloader")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::settings_repo::{KEY_LEDGER_FLUSH_MS, KEY_PAUSED_TTL_HOURS};

    #[test]
    fn test_layout() {
        let config = DownloaderConfig::new("/data");
        assert_eq!(config.models_dir, PathBuf::from("/data/models"));
        assert_eq!(config.temp_dir, PathBuf::from("/data/tmp"));
        assert_eq!(config.database_path, PathBuf::from("/data/downloader.db"));
        assert_eq!(config.paused_ttl, Some(DEFAULT_PAUSED_TTL));
    }

    #[test]
    fn test_extensions_are_case_insensitive() {
        let config = DownloaderConfig::new("/data");
        assert!(config.has_allowed_extension("Model.GGUF"));
        assert!(!config.has_allowed_extension("model.bin"));
        assert!(!config.has_allowed_extension("gguf"));
    }

    #[test]
    fn test_settings_override_defaults() {
        let db = DatabaseManager::open_in_memory().unwrap();
        db.set_u64_setting(KEY_LEDGER_FLUSH_MS, 250).unwrap();
        db.set_u64_setting(KEY_PAUSED_TTL_HOURS, 0).unwrap();

        let mut config = DownloaderConfig::new("/data");
        config.apply_settings(&db);

        assert_eq!(config.ledger_flush_interval, Duration::from_millis(250));
        assert_eq!(config.paused_ttl, None);
        assert_eq!(config.query_timeout, DEFAULT_QUERY_TIMEOUT);
    }

    #[test]
    fn test_volatile_sources() {
        let config = DownloaderConfig::new("/data");
        assert!(config.is_volatile_source(&std::env::temp_dir().join("picked.gguf")));
        assert!(config.is_volatile_source(Path::new("/data/tmp/x.gguf")));
        assert!(!config.is_volatile_source(Path::new("/data/models/x.gguf")));
    }
}
