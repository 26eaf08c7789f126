// External link registry repository
// Models used in place from outside managed storage

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::models::ExternalLink;
use super::DatabaseManager;

impl DatabaseManager {
    /// Register a link. Fails if the name is already taken.
    pub fn insert_external_link(&self, link: &ExternalLink) -> Result<()> {
        self.with_connection(|conn| {
            insert_external_link_impl(conn, link)
        })
    }

    /// All links ordered by name
    pub fn list_external_links(&self) -> Result<Vec<ExternalLink>> {
        self.with_connection(|conn| {
            list_external_links_impl(conn)
        })
    }

    pub fn get_external_link(&self, name: &str) -> Result<Option<ExternalLink>> {
        self.with_connection(|conn| {
            get_external_link_impl(conn, name)
        })
    }

    /// Remove a link. Returns false if no such link existed.
    pub fn delete_external_link(&self, name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            delete_external_link_impl(conn, name)
        })
    }

    /// Record a fresh size observed during a refresh
    pub fn update_external_link_size(&self, name: &str, size_bytes: u64) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE external_links SET size_bytes = ?1 WHERE name = ?2",
                params![size_bytes as i64, name],
            ).context("Failed to update external link size")?;
            Ok(())
        })
    }
}

fn insert_external_link_impl(conn: &Connection, link: &ExternalLink) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO external_links (name, source_uri, size_bytes, linked_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            link.name,
            link.source_uri,
            link.size_bytes as i64,
            link.linked_at.to_rfc3339(),
        ],
    ).context("Failed to insert external link")?;

    Ok(())
}

fn list_external_links_impl(conn: &Connection) -> Result<Vec<ExternalLink>> {
    let mut stmt = conn.prepare(
        "SELECT name, source_uri, size_bytes, linked_at FROM external_links ORDER BY name"
    ).context("Failed to prepare list_external_links query")?;

    let links = stmt.query_map([], row_to_link)
        .context("Failed to query external links")?;

    links.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect external links")
}

fn get_external_link_impl(conn: &Connection, name: &str) -> Result<Option<ExternalLink>> {
    let result = conn.query_row(
        "SELECT name, source_uri, size_bytes, linked_at FROM external_links WHERE name = ?",
        params![name],
        row_to_link,
    );

    match result {
        Ok(link) => Ok(Some(link)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get external link"),
    }
}

fn delete_external_link_impl(conn: &Connection, name: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM external_links WHERE name = ?",
        params![name],
    ).context("Failed to delete external link")?;

    Ok(deleted > 0)
}

fn row_to_link(row: &Row<'_>) -> rusqlite::Result<ExternalLink> {
    let linked_at: String = row.get(3)?;
    Ok(ExternalLink {
        name: row.get(0)?,
        source_uri: row.get(1)?,
        size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
        linked_at: DateTime::parse_from_rfc3339(&linked_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_db() -> DatabaseManager {
        DatabaseManager::open_in_memory().unwrap()
    }

    fn link(name: &str) -> ExternalLink {
        ExternalLink {
            name: name.to_string(),
            source_uri: format!("/sdcard/Download/{}", name),
            size_bytes: 1234,
            linked_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_list() {
        let db = create_test_db();
        db.insert_external_link(&link("b.gguf")).unwrap();
        db.insert_external_link(&link("a.gguf")).unwrap();

        let names: Vec<String> = db.list_external_links().unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["a.gguf", "b.gguf"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let db = create_test_db();
        db.insert_external_link(&link("a.gguf")).unwrap();
        assert!(db.insert_external_link(&link("a.gguf")).is_err());
    }

    #[test]
    fn test_delete_and_update_size() {
        let db = create_test_db();
        db.insert_external_link(&link("a.gguf")).unwrap();

        db.update_external_link_size("a.gguf", 99).unwrap();
        assert_eq!(db.get_external_link("a.gguf").unwrap().unwrap().size_bytes, 99);

        assert!(db.delete_external_link("a.gguf").unwrap());
        assert!(!db.delete_external_link("a.gguf").unwrap());
        assert!(db.get_external_link("a.gguf").unwrap().is_none());
    }
}
