// Database migrations for the model downloader
// Creates and updates the database schema

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::collections::HashMap;

use super::models::{DownloadStatus, DownloadTask};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Settings key under which older releases kept the ledger as one JSON blob
pub const LEGACY_LEDGER_KEY: &str = "download_progress";

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    ).unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    ).context("Failed to read schema version")?;

    Ok(version.unwrap_or(0))
}

/// Initial schema creation (version 1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v1");

    conn.execute_batch(r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Settings table: Key-value store for overrides and legacy blobs
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            value_type TEXT NOT NULL DEFAULT 'string',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Download ledger: one row per non-terminal transfer
        CREATE TABLE IF NOT EXISTS download_ledger (
            file_name TEXT PRIMARY KEY NOT NULL,
            download_id TEXT NOT NULL UNIQUE,
            source_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'starting',
            bytes_downloaded INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_updated_at TEXT NOT NULL,
            error_message TEXT
        );

        -- External link registry: models used in place, never copied
        CREATE TABLE IF NOT EXISTS external_links (
            name TEXT PRIMARY KEY NOT NULL,
            source_uri TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            linked_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_external_links_uri ON external_links(source_uri);

        INSERT INTO schema_version (version) VALUES (1);
    "#).context("Failed to run migration v1")?;

    Ok(())
}

/// Shape of one entry in the legacy JSON ledger
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyLedgerEntry {
    download_id: serde_json::Value,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    bytes_downloaded: u64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    status: String,
}

/// Move the legacy JSON ledger blob into `download_ledger` (version 2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v2");

    let tx = conn.unchecked_transaction()
        .context("Failed to begin migration v2")?;

    let blob: Option<String> = match tx.query_row(
        "SELECT value FROM settings WHERE key = ?",
        params![LEGACY_LEDGER_KEY],
        |row| row.get(0),
    ) {
        Ok(value) => Some(value),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e).context("Failed to read legacy ledger"),
    };

    if let Some(blob) = blob {
        let imported = import_legacy_ledger(&tx, &blob)?;
        log::info!("Imported {} legacy ledger entries", imported);

        tx.execute("DELETE FROM settings WHERE key = ?", params![LEGACY_LEDGER_KEY])
            .context("Failed to remove legacy ledger")?;
    }

    tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])
        .context("Failed to record migration v2")?;

    tx.commit().context("Failed to commit migration v2")?;
    Ok(())
}

fn import_legacy_ledger(conn: &Connection, blob: &str) -> Result<usize> {
    let entries: HashMap<String, LegacyLedgerEntry> = match serde_json::from_str(blob) {
        Ok(entries) => entries,
        Err(e) => {
            // Unreadable blobs are dropped; reconciliation has nothing to go on anyway
            log::warn!("Discarding unreadable legacy ledger: {}", e);
            return Ok(0);
        }
    };

    let mut imported = 0;
    for (file_name, entry) in entries {
        let status = DownloadStatus::parse(&entry.status).unwrap_or(DownloadStatus::Downloading);
        if status.is_terminal() || entry.progress >= 100.0 {
            continue;
        }

        let download_id = match &entry.download_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let mut task = DownloadTask::new("", &file_name);
        task.download_id = download_id;
        task.status = status;
        task.bytes_downloaded = entry.bytes_downloaded;
        task.total_bytes = entry.total_bytes;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO download_ledger (
                file_name, download_id, source_url, status,
                bytes_downloaded, total_bytes, created_at, last_updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                task.destination_file_name,
                task.download_id,
                task.source_url,
                task.status.as_str(),
                task.bytes_downloaded as i64,
                task.total_bytes as i64,
                task.created_at.to_rfc3339(),
                task.last_updated_at.to_rfc3339(),
            ],
        ).context("Failed to import legacy ledger entry")?;
        imported += 1;
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_migrations() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let conn = Connection::open(&db_path).unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Idempotent
        run_migrations(&conn).unwrap();
        let rows: i64 = conn.query_row(
            "SELECT COUNT(*) FROM schema_version",
            [],
            |row| row.get(0),
        ).unwrap();
        assert_eq!(rows, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_legacy_ledger_is_imported() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();

        let blob = serde_json::json!({
            "llama.gguf": {
                "downloadId": 42,
                "progress": 40,
                "bytesDownloaded": 400,
                "totalBytes": 1000,
                "status": "downloading"
            },
            "done.gguf": {
                "downloadId": 7,
                "progress": 100,
                "bytesDownloaded": 10,
                "totalBytes": 10,
                "status": "completed"
            }
        });
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)",
            params![LEGACY_LEDGER_KEY, blob.to_string()],
        ).unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);

        let (id, status, bytes): (String, String, i64) = conn.query_row(
            "SELECT download_id, status, bytes_downloaded FROM download_ledger WHERE file_name = 'llama.gguf'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        ).unwrap();
        assert_eq!(id, "42");
        assert_eq!(status, "downloading");
        assert_eq!(bytes, 400);

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM download_ledger", [], |row| row.get(0)).unwrap();
        assert_eq!(total, 1);

        let leftover: i64 = conn.query_row(
            "SELECT COUNT(*) FROM settings WHERE key = ?",
            params![LEGACY_LEDGER_KEY],
            |row| row.get(0),
        ).unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_garbage_legacy_blob_is_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, 'not json')",
            params![LEGACY_LEDGER_KEY],
        ).unwrap();

        run_migrations(&conn).unwrap();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM download_ledger", [], |row| row.get(0)).unwrap();
        assert_eq!(total, 0);
    }
}
