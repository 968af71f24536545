//! SQLite schema for the durable collections
//!
//! One table per entity kind. Each row keeps the entity as a JSON payload next
//! to the columns the store filters and orders on, plus the write sequence
//! and dirty flag the sync engine uses to find unconfirmed local writes.
//! Timestamps are stored as microseconds since the Unix epoch.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Tables holding syncable entities, all with the same row shape
pub const ENTITY_TABLES: [&str; 5] = [
    "books",
    "notes",
    "reading_positions",
    "bookmarks",
    "preferences",
];

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Metadata record: schema version, sync watermark, write sequence,
        -- cache counters
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reading_positions (
            id TEXT PRIMARY KEY,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL
        );

        -- Added in version 2
        CREATE TABLE IF NOT EXISTS bookmarks (
            id TEXT PRIMARY KEY,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL
        );

        -- Singleton row keyed 'user'
        CREATE TABLE IF NOT EXISTS preferences (
            id TEXT PRIMARY KEY,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL
        );

        -- Deletions waiting to be pushed
        CREATE TABLE IF NOT EXISTS tombstones (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            deleted_at INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (kind, id)
        );

        -- AI summary cache, keyed by content hash + options
        CREATE TABLE IF NOT EXISTS summaries (
            cache_key TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            book_id TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER,
            payload TEXT NOT NULL
        );

        -- Indexes for common query patterns

        CREATE INDEX IF NOT EXISTS idx_books_created_at ON books(created_at);
        CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
        CREATE INDEX IF NOT EXISTS idx_notes_book_id ON notes(book_id);
        CREATE INDEX IF NOT EXISTS idx_positions_book_id ON reading_positions(book_id);
        CREATE INDEX IF NOT EXISTS idx_bookmarks_book_id ON bookmarks(book_id);

        -- Pending mutations in write order
        CREATE INDEX IF NOT EXISTS idx_books_dirty ON books(dirty, seq);
        CREATE INDEX IF NOT EXISTS idx_notes_dirty ON notes(dirty, seq);
        CREATE INDEX IF NOT EXISTS idx_positions_dirty ON reading_positions(dirty, seq);
        CREATE INDEX IF NOT EXISTS idx_bookmarks_dirty ON bookmarks(dirty, seq);
        CREATE INDEX IF NOT EXISTS idx_tombstones_dirty ON tombstones(dirty, seq);

        CREATE INDEX IF NOT EXISTS idx_summaries_expires_at ON summaries(expires_at);
        CREATE INDEX IF NOT EXISTS idx_summaries_book_id ON summaries(book_id);
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = 'schema_version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
