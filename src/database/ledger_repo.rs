// Download ledger repository
// One row per in-flight transfer, keyed by destination file name

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::models::{DownloadStatus, DownloadTask};
use super::DatabaseManager;

impl DatabaseManager {
    /// Insert or replace the ledger row for `task.destination_file_name`
    pub fn upsert_download_task(&self, task: &DownloadTask) -> Result<()> {
        self.with_connection(|conn| {
            upsert_download_task_impl(conn, task)
        })
    }

    /// Get a ledger row by file name
    pub fn get_download_task(&self, file_name: &str) -> Result<Option<DownloadTask>> {
        self.with_connection(|conn| {
            get_download_task_impl(conn, file_name)
        })
    }

    /// Get a ledger row by transfer id
    pub fn find_download_task_by_id(&self, download_id: &str) -> Result<Option<DownloadTask>> {
        self.with_connection(|conn| {
            find_download_task_by_id_impl(conn, download_id)
        })
    }

    /// All ledger rows, oldest first
    pub fn list_download_tasks(&self) -> Result<Vec<DownloadTask>> {
        self.with_connection(|conn| {
            list_download_tasks_impl(conn)
        })
    }

    /// Remove a ledger row. Returns false if nothing was stored under that name.
    pub fn delete_download_task(&self, file_name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            delete_download_task_impl(conn, file_name)
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT file_name, download_id, source_url, status, bytes_downloaded,
           total_bytes, created_at, last_updated_at, error_message
    FROM download_ledger
"#;

fn upsert_download_task_impl(conn: &Connection, task: &DownloadTask) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO download_ledger (
            file_name, download_id, source_url, status, bytes_downloaded,
            total_bytes, created_at, last_updated_at, error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(file_name) DO UPDATE SET
            download_id = excluded.download_id,
            source_url = excluded.source_url,
            status = excluded.status,
            bytes_downloaded = excluded.bytes_downloaded,
            total_bytes = excluded.total_bytes,
            last_updated_at = excluded.last_updated_at,
            error_message = excluded.error_message
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
            task.error_message,
        ],
    ).context("Failed to upsert download task")?;

    Ok(())
}

fn get_download_task_impl(conn: &Connection, file_name: &str) -> Result<Option<DownloadTask>> {
    let sql = format!("{} WHERE file_name = ?", SELECT_COLUMNS);
    let result = conn.query_row(&sql, params![file_name], row_to_task);

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get download task"),
    }
}

fn find_download_task_by_id_impl(conn: &Connection, download_id: &str) -> Result<Option<DownloadTask>> {
    let sql = format!("{} WHERE download_id = ?", SELECT_COLUMNS);
    let result = conn.query_row(&sql, params![download_id], row_to_task);

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to find download task"),
    }
}

fn list_download_tasks_impl(conn: &Connection) -> Result<Vec<DownloadTask>> {
    let sql = format!("{} ORDER BY created_at ASC, file_name ASC", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)
        .context("Failed to prepare list_download_tasks query")?;

    let tasks = stmt.query_map([], row_to_task)
        .context("Failed to query download tasks")?;

    tasks.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect download tasks")
}

fn delete_download_task_impl(conn: &Connection, file_name: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM download_ledger WHERE file_name = ?",
        params![file_name],
    ).context("Failed to delete download task")?;

    Ok(deleted > 0)
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<DownloadTask> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let last_updated_at: String = row.get(7)?;

    Ok(DownloadTask {
        destination_file_name: row.get(0)?,
        download_id: row.get(1)?,
        source_url: row.get(2)?,
        // Unknown statuses come from newer builds; treat them as running and let reconciliation decide
        status: DownloadStatus::parse(&status).unwrap_or(DownloadStatus::Downloading),
        bytes_downloaded: row.get::<_, i64>(4)?.max(0) as u64,
        total_bytes: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: parse_timestamp(&created_at),
        last_updated_at: parse_timestamp(&last_updated_at),
        error_message: row.get(8)?,
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            log::warn!("Unparseable ledger timestamp {:?}, using now", value);
            Utc::now()
        })
}
