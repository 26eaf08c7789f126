// Database models - Settings
use serde::{Deserialize, Serialize};

/// Downloader overrides read from the settings table.
/// `None` means "keep the built-in default".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DownloadSettings {
    pub ledger_flush_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
    pub background_budget_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    /// 0 disables expiry of paused downloads
    pub paused_ttl_hours: Option<u64>,
}
