// Settings repository for the model downloader
// Key-value overrides for timing knobs, read once at construction

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::DownloadSettings;
use super::DatabaseManager;

pub const KEY_LEDGER_FLUSH_MS: &str = "downloads.ledger_flush_ms";
pub const KEY_QUERY_TIMEOUT_MS: &str = "downloads.query_timeout_ms";
pub const KEY_BACKGROUND_BUDGET_SECS: &str = "downloads.background_budget_secs";
pub const KEY_STALL_TIMEOUT_SECS: &str = "downloads.stall_timeout_secs";
pub const KEY_PAUSED_TTL_HOURS: &str = "downloads.paused_ttl_hours";

impl DatabaseManager {
    /// Get a single setting by key
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            get_setting_impl(conn, key)
        })
    }

    /// Set a single setting
    pub fn set_setting(&self, key: &str, value: &str, value_type: &str) -> Result<()> {
        self.with_connection(|conn| {
            set_setting_impl(conn, key, value, value_type)
        })
    }

    /// Set an integer setting
    pub fn set_u64_setting(&self, key: &str, value: u64) -> Result<()> {
        self.set_setting(key, &value.to_string(), "integer")
    }

    /// Load the downloader overrides
    pub fn load_download_settings(&self) -> Result<DownloadSettings> {
        self.with_connection(|conn| {
            load_download_settings_impl(conn)
        })
    }
}

fn get_setting_impl(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT value FROM settings WHERE key = ?"
    ).context("Failed to prepare get_setting query")?;

    let result = stmt.query_row(params![key], |row| row.get(0));

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get setting"),
    }
}

fn set_setting_impl(conn: &Connection, key: &str, value: &str, value_type: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO settings (key, value, value_type, updated_at)
        VALUES (?1, ?2, ?3, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            value_type = excluded.value_type,
            updated_at = datetime('now')
        "#,
        params![key, value, value_type],
    ).context("Failed to set setting")?;

    Ok(())
}

fn load_download_settings_impl(conn: &Connection) -> Result<DownloadSettings> {
    let mut settings = DownloadSettings::default();

    let mut stmt = conn.prepare(
        "SELECT key, value FROM settings WHERE key LIKE 'downloads.%'"
    ).context("Failed to prepare load_download_settings query")?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
        ))
    }).context("Failed to query settings")?;

    for row in rows {
        let (key, value) = row.context("Failed to read setting row")?;

        let parsed = match value.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Ignoring non-numeric setting {} = {:?}", key, value);
                continue;
            }
        };

        match key.as_str() {
            KEY_LEDGER_FLUSH_MS => settings.ledger_flush_ms = Some(parsed),
            KEY_QUERY_TIMEOUT_MS => settings.query_timeout_ms = Some(parsed),
            KEY_BACKGROUND_BUDGET_SECS => settings.background_budget_secs = Some(parsed),
            KEY_STALL_TIMEOUT_SECS => settings.stall_timeout_secs = Some(parsed),
            KEY_PAUSED_TTL_HOURS => settings.paused_ttl_hours = Some(parsed),
            _ => {
                log::debug!("Unknown setting key: {}", key);
            }
        }
    }

    Ok(settings)
}
