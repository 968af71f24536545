//! Durable keyed collections
//!
//! Thin row-level access to the SQLite tables. Entities are stored as JSON
//! payloads; the store decodes them. Helpers take a `&Connection` so they
//! work both directly and inside a transaction.
//!
//! ## Tables
//!
//! - `books`, `notes`, `reading_positions`, `bookmarks`, `preferences` -
//!   entity rows
//! - `tombstones` - deletions not yet confirmed by the remote
//! - `summaries` - AI summary cache
//! - `meta` - watermark, write sequence, cache counters

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::config::Config;
use crate::models::EntityKind;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::{init_schema, needs_init};

/// Metadata keys
pub mod keys {
    pub const LAST_SYNCED_AT: &str = "last_synced_at";
    pub const WRITE_SEQ: &str = "write_seq";
    pub const CACHE_EVICTED: &str = "cache_evicted";
    pub const CACHE_EXPIRED: &str = "cache_expired";
}

/// SQLite database holding every collection
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the SQLite database
    pub fn open(config: &Config) -> StorageResult<Self> {
        let path = config.sqlite_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::create_directory(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(&path).map_err(|e| StorageError::open(e, path.clone()))?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Mutable access for opening transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Classify a SQLite failure with this database's path
    pub fn classify(&self, error: rusqlite::Error) -> StorageError {
        StorageError::from_sqlite(error, self.path.clone().unwrap_or_default())
    }
}

// ==================== Timestamps ====================

pub fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

// ==================== Entity rows ====================

/// One stored entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub id: String,
    pub book_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Store-wide write sequence of the last local write
    pub seq: i64,
    /// Written locally and not yet confirmed by the remote
    pub dirty: bool,
    pub payload: String,
}

const ENTITY_COLUMNS: &str = "id, book_id, created_at, updated_at, seq, dirty, payload";

fn entity_row(row: &rusqlite::Row<'_>) -> Result<EntityRow> {
    Ok(EntityRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        seq: row.get(4)?,
        dirty: row.get(5)?,
        payload: row.get(6)?,
    })
}

/// Insert or replace an entity row
pub fn upsert_row(conn: &Connection, table: &str, row: &EntityRow) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {table} ({ENTITY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ),
        params![
            row.id,
            row.book_id,
            row.created_at,
            row.updated_at,
            row.seq,
            row.dirty,
            row.payload,
        ],
    )?;
    Ok(())
}

pub fn get_row(conn: &Connection, table: &str, id: &str) -> Result<Option<EntityRow>> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLUMNS} FROM {table} WHERE id = ?"),
        params![id],
        entity_row,
    )
    .optional()
}

/// Delete a row, returning whether it existed
pub fn delete_row(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let deleted = conn.execute(&format!("DELETE FROM {table} WHERE id = ?"), params![id])?;
    Ok(deleted > 0)
}

/// All rows ordered by creation time, optionally scoped to one book
pub fn list_rows(conn: &Connection, table: &str, book_id: Option<&str>) -> Result<Vec<EntityRow>> {
    let mut stmt = match book_id {
        Some(_) => conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM {table} WHERE book_id = ?1 ORDER BY created_at, id"
        ))?,
        None => conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM {table} ORDER BY created_at, id"
        ))?,
    };

    let rows = match book_id {
        Some(book_id) => stmt.query_map(params![book_id], entity_row)?,
        None => stmt.query_map([], entity_row)?,
    };
    rows.collect()
}

/// Remove every row belonging to a book, returning the removed ids
pub fn delete_rows_for_book(conn: &Connection, table: &str, book_id: &str) -> Result<Vec<String>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(&format!("SELECT id FROM {table} WHERE book_id = ?"))?;
        let ids = stmt.query_map(params![book_id], |row| row.get(0))?;
        ids.collect::<Result<_>>()?
    };
    conn.execute(
        &format!("DELETE FROM {table} WHERE book_id = ?"),
        params![book_id],
    )?;
    Ok(ids)
}

/// Unconfirmed rows in write order
pub fn dirty_rows(conn: &Connection, table: &str, limit: usize) -> Result<Vec<EntityRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTITY_COLUMNS} FROM {table} WHERE dirty = 1 ORDER BY seq LIMIT ?"
    ))?;
    let rows = stmt.query_map(params![limit as i64], entity_row)?;
    rows.collect()
}

/// Clear the dirty flag if the row has not been rewritten since `seq`
pub fn mark_clean(conn: &Connection, table: &str, id: &str, seq: i64) -> Result<bool> {
    let updated = conn.execute(
        &format!("UPDATE {table} SET dirty = 0 WHERE id = ? AND seq = ?"),
        params![id, seq],
    )?;
    Ok(updated > 0)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

pub fn count_dirty(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE dirty = 1"),
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

// ==================== Tombstones ====================

/// A local deletion waiting to be pushed
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub kind: EntityKind,
    pub id: String,
    pub deleted_at: i64,
    pub seq: i64,
}

fn parse_kind(value: &str) -> Option<EntityKind> {
    match value {
        "book" => Some(EntityKind::Book),
        "note" => Some(EntityKind::Note),
        "position" => Some(EntityKind::Position),
        "bookmark" => Some(EntityKind::Bookmark),
        "preferences" => Some(EntityKind::Preferences),
        "summary" => Some(EntityKind::Summary),
        _ => None,
    }
}

pub fn put_tombstone(conn: &Connection, tombstone: &Tombstone) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tombstones (kind, id, deleted_at, seq, dirty) VALUES (?, ?, ?, ?, 1)",
        params![
            tombstone.kind.as_str(),
            tombstone.id,
            tombstone.deleted_at,
            tombstone.seq,
        ],
    )?;
    Ok(())
}

pub fn remove_tombstone(conn: &Connection, kind: EntityKind, id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM tombstones WHERE kind = ? AND id = ?",
        params![kind.as_str(), id],
    )?;
    Ok(())
}

pub fn get_tombstone(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<Tombstone>> {
    conn.query_row(
        "SELECT deleted_at, seq FROM tombstones WHERE kind = ? AND id = ?",
        params![kind.as_str(), id],
        |row| {
            Ok(Tombstone {
                kind,
                id: id.to_string(),
                deleted_at: row.get(0)?,
                seq: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Unconfirmed deletions in write order
pub fn dirty_tombstones(conn: &Connection, limit: usize) -> Result<Vec<Tombstone>> {
    let mut stmt = conn.prepare(
        "SELECT kind, id, deleted_at, seq FROM tombstones WHERE dirty = 1 ORDER BY seq LIMIT ?",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut tombstones = Vec::new();
    for row in rows {
        let (kind, id, deleted_at, seq) = row?;
        // Rows with an unknown kind are skipped rather than failing the batch
        if let Some(kind) = parse_kind(&kind) {
            tombstones.push(Tombstone {
                kind,
                id,
                deleted_at,
                seq,
            });
        }
    }
    Ok(tombstones)
}

/// Drop a confirmed tombstone unless it was rewritten since `seq`
pub fn confirm_tombstone(conn: &Connection, kind: EntityKind, id: &str, seq: i64) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM tombstones WHERE kind = ? AND id = ? AND seq = ?",
        params![kind.as_str(), id, seq],
    )?;
    Ok(deleted > 0)
}

pub fn count_tombstones(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM tombstones", [], |row| row.get(0))?;
    Ok(count as usize)
}

// ==================== Summaries ====================

/// One cached summary
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub cache_key: String,
    pub content_hash: String,
    pub book_id: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub payload: String,
}

const SUMMARY_COLUMNS: &str = "cache_key, content_hash, book_id, created_at, expires_at, payload";

fn summary_row(row: &rusqlite::Row<'_>) -> Result<SummaryRow> {
    Ok(SummaryRow {
        cache_key: row.get(0)?,
        content_hash: row.get(1)?,
        book_id: row.get(2)?,
        created_at: row.get(3)?,
        expires_at: row.get(4)?,
        payload: row.get(5)?,
    })
}

pub fn put_summary(conn: &Connection, row: &SummaryRow) -> Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO summaries ({SUMMARY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"),
        params![
            row.cache_key,
            row.content_hash,
            row.book_id,
            row.created_at,
            row.expires_at,
            row.payload,
        ],
    )?;
    Ok(())
}

pub fn get_summary(conn: &Connection, cache_key: &str) -> Result<Option<SummaryRow>> {
    conn.query_row(
        &format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE cache_key = ?"),
        params![cache_key],
        summary_row,
    )
    .optional()
}

pub fn all_summaries(conn: &Connection) -> Result<Vec<SummaryRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM summaries ORDER BY created_at, cache_key"
    ))?;
    let rows = stmt.query_map([], summary_row)?;
    rows.collect()
}

pub fn delete_summary(conn: &Connection, cache_key: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM summaries WHERE cache_key = ?",
        params![cache_key],
    )?;
    Ok(deleted > 0)
}

/// Remove every summary whose expiry is before `now`, returning how many
pub fn delete_expired_summaries(conn: &Connection, now: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM summaries WHERE expires_at IS NOT NULL AND expires_at < ?",
        params![now],
    )
}

pub fn delete_summaries_for_book(conn: &Connection, book_id: &str) -> Result<usize> {
    conn.execute("DELETE FROM summaries WHERE book_id = ?", params![book_id])
}

pub fn clear_summaries(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM summaries", [])
}

pub fn count_summaries(conn: &Connection) -> Result<usize> {
    count_rows(conn, "summaries")
}

// ==================== Metadata ====================

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
    })
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta_i64(conn: &Connection, key: &str) -> Result<i64> {
    Ok(get_meta(conn, key)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Add `delta` to a numeric metadata value
pub fn add_meta_i64(conn: &Connection, key: &str, delta: i64) -> Result<i64> {
    let value = get_meta_i64(conn, key)? + delta;
    set_meta(conn, key, &value.to_string())?;
    Ok(value)
}

/// Allocate the next write sequence number
pub fn next_seq(conn: &Connection) -> Result<i64> {
    add_meta_i64(conn, keys::WRITE_SEQ, 1)
}

/// Latest update stamp across all entity tables
pub fn latest_stamp(conn: &Connection) -> Result<Option<i64>> {
    let mut latest: Option<i64> = None;
    for table in crate::storage::schema::ENTITY_TABLES {
        let max: Option<i64> =
            conn.query_row(&format!("SELECT MAX(updated_at) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        latest = latest.max(max);
    }
    let tombstone: Option<i64> =
        conn.query_row("SELECT MAX(deleted_at) FROM tombstones", [], |row| row.get(0))?;
    Ok(latest.max(tombstone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_under_a_file_reports_directory_failure() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let config = Config::with_data_dir(blocker.join("airis"));
        let err = Database::open(&config).unwrap_err();
        assert!(matches!(err, StorageError::CreateDirectory { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    fn row(id: &str, book_id: Option<&str>, created_at: i64, seq: i64) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            book_id: book_id.map(str::to_string),
            created_at,
            updated_at: created_at,
            seq,
            dirty: true,
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        upsert_row(conn, "books", &row("b1", None, 10, 1)).unwrap();
        let found = get_row(conn, "books", "b1").unwrap().unwrap();
        assert_eq!(found.created_at, 10);
        assert!(found.dirty);

        assert!(get_row(conn, "books", "missing").unwrap().is_none());
    }

    #[test]
    fn test_list_ordered_by_created_at() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        upsert_row(conn, "notes", &row("late", Some("b1"), 30, 1)).unwrap();
        upsert_row(conn, "notes", &row("early", Some("b1"), 10, 2)).unwrap();
        upsert_row(conn, "notes", &row("other", Some("b2"), 20, 3)).unwrap();

        let all: Vec<String> = list_rows(conn, "notes", None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(all, vec!["early", "other", "late"]);

        let scoped = list_rows(conn, "notes", Some("b1")).unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[test]
    fn test_delete_rows_for_book() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        upsert_row(conn, "notes", &row("n1", Some("b1"), 1, 1)).unwrap();
        upsert_row(conn, "notes", &row("n2", Some("b1"), 2, 2)).unwrap();
        upsert_row(conn, "notes", &row("n3", Some("b2"), 3, 3)).unwrap();

        let mut removed = delete_rows_for_book(conn, "notes", "b1").unwrap();
        removed.sort();
        assert_eq!(removed, vec!["n1", "n2"]);
        assert_eq!(count_rows(conn, "notes").unwrap(), 1);
    }

    #[test]
    fn test_mark_clean_requires_matching_seq() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        upsert_row(conn, "books", &row("b1", None, 1, 5)).unwrap();
        assert!(!mark_clean(conn, "books", "b1", 4).unwrap());
        assert_eq!(count_dirty(conn, "books").unwrap(), 1);

        assert!(mark_clean(conn, "books", "b1", 5).unwrap());
        assert_eq!(count_dirty(conn, "books").unwrap(), 0);
        assert!(dirty_rows(conn, "books", 10).unwrap().is_empty());
    }

    #[test]
    fn test_dirty_rows_in_seq_order_with_limit() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        upsert_row(conn, "books", &row("b3", None, 1, 3)).unwrap();
        upsert_row(conn, "books", &row("b1", None, 2, 1)).unwrap();
        upsert_row(conn, "books", &row("b2", None, 3, 2)).unwrap();

        let ids: Vec<String> = dirty_rows(conn, "books", 2)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[test]
    fn test_tombstones() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let tombstone = Tombstone {
            kind: EntityKind::Book,
            id: "b1".to_string(),
            deleted_at: 100,
            seq: 7,
        };
        put_tombstone(conn, &tombstone).unwrap();
        assert_eq!(dirty_tombstones(conn, 10).unwrap(), vec![tombstone.clone()]);
        assert_eq!(
            get_tombstone(conn, EntityKind::Book, "b1").unwrap(),
            Some(tombstone)
        );

        assert!(!confirm_tombstone(conn, EntityKind::Book, "b1", 6).unwrap());
        assert!(confirm_tombstone(conn, EntityKind::Book, "b1", 7).unwrap());
        assert_eq!(count_tombstones(conn).unwrap(), 0);
    }

    #[test]
    fn test_expired_summaries_deleted() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let summary = |key: &str, expires_at: Option<i64>| SummaryRow {
            cache_key: key.to_string(),
            content_hash: key.to_string(),
            book_id: None,
            created_at: 0,
            expires_at,
            payload: "{}".to_string(),
        };
        put_summary(conn, &summary("old", Some(10))).unwrap();
        put_summary(conn, &summary("fresh", Some(1000))).unwrap();
        put_summary(conn, &summary("forever", None)).unwrap();

        assert_eq!(delete_expired_summaries(conn, 500).unwrap(), 1);
        assert_eq!(count_summaries(conn).unwrap(), 2);
        assert!(get_summary(conn, "old").unwrap().is_none());
    }

    #[test]
    fn test_meta_counters_and_seq() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        assert_eq!(next_seq(conn).unwrap(), 1);
        assert_eq!(next_seq(conn).unwrap(), 2);
        assert_eq!(add_meta_i64(conn, keys::CACHE_EVICTED, 3).unwrap(), 3);
        assert_eq!(get_meta_i64(conn, keys::CACHE_EXPIRED).unwrap(), 0);

        set_meta(conn, keys::LAST_SYNCED_AT, "42").unwrap();
        assert_eq!(
            get_meta(conn, keys::LAST_SYNCED_AT).unwrap(),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_latest_stamp() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        assert_eq!(latest_stamp(conn).unwrap(), None);

        upsert_row(conn, "books", &row("b1", None, 50, 1)).unwrap();
        put_tombstone(
            conn,
            &Tombstone {
                kind: EntityKind::Note,
                id: "n1".to_string(),
                deleted_at: 80,
                seq: 2,
            },
        )
        .unwrap();
        assert_eq!(latest_stamp(conn).unwrap(), Some(80));
    }

    #[test]
    fn test_micros_round_trip() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(from_micros(to_micros(t)), t);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path().join("nested"));
        let db = Database::open(&config).unwrap();
        assert_eq!(db.path(), Some(config.sqlite_path().as_path()));
        assert!(config.sqlite_path().exists());
    }
}
