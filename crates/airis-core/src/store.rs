//! Unified storage interface
//!
//! The `Store` is the single write path for every entity. It:
//! - stamps writes through its [`Clock`]
//! - validates entity invariants before anything is persisted
//! - consults the [`QuotaGuard`] before every write
//! - commits each write (including a cascading book delete) in one SQLite
//!   transaction
//! - publishes the matching [`StoreEvent`] only after the commit
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = Store::open(config)?;
//!
//! let book = store.put(Book::new("Dế Mèn phiêu lưu ký", BookFormat::Epub))?;
//! store.put(Note::new(book.id, "Chương 1 rất hay"))?;
//!
//! let notes = store.notes_for_book(book.id)?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::EvictionPolicy;
use crate::clock::{truncate_micros, Clock, Stamper, SystemClock};
use crate::config::Config;
use crate::error::{StoreError, StoreResult, ValidationError};
use crate::events::{EventBus, StoreEvent};
use crate::models::{
    Book, Bookmark, EntityKind, Location, Note, PreferencesPatch, ReadingPosition, Record,
    UserPreferences,
};
use crate::quota::{DirectoryEstimator, QuotaGuard, StorageEstimate, StorageEstimator};
use crate::storage::collections::{self as rows, from_micros, keys, to_micros, EntityRow, Tombstone};
use crate::storage::{Database, StorageError};

/// A store shared between the application and background tasks
pub type SharedStore = Arc<tokio::sync::Mutex<Store>>;

const PREFERENCES_TABLE: &str = "preferences";

/// Backing table of a syncable entity kind
pub fn table_for(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Book => Some(Book::TABLE),
        EntityKind::Note => Some(Note::TABLE),
        EntityKind::Position => Some(ReadingPosition::TABLE),
        EntityKind::Bookmark => Some(Bookmark::TABLE),
        EntityKind::Preferences => Some(PREFERENCES_TABLE),
        EntityKind::Summary => None,
    }
}

const SYNCED_KINDS: [EntityKind; 5] = [
    EntityKind::Book,
    EntityKind::Note,
    EntityKind::Position,
    EntityKind::Bookmark,
    EntityKind::Preferences,
];

/// Filter for [`Store::list`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    /// Only records belonging to this book
    pub book_id: Option<Uuid>,
    /// Case-insensitive text match
    pub query: Option<String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn for_book(book_id: Uuid) -> Self {
        Self {
            book_id: Some(book_id),
            ..Self::default()
        }
    }

    pub fn matching(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A local write not yet confirmed by the remote
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub kind: EntityKind,
    pub id: String,
    /// Write sequence of the local version
    pub seq: i64,
    /// Set when the change is a deletion
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PendingChange {
    pub fn is_deletion(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Portable dump of all user data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub books: Vec<Book>,
    pub notes: Vec<Note>,
    pub positions: Vec<ReadingPosition>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    pub preferences: UserPreferences,
}

impl Snapshot {
    pub const VERSION: u32 = 1;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub books: usize,
    pub notes: usize,
    pub positions: usize,
    pub bookmarks: usize,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub books: usize,
    pub notes: usize,
    pub positions: usize,
    pub bookmarks: usize,
    pub summaries: usize,
    /// Local writes and deletions awaiting sync
    pub pending: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub estimate: StorageEstimate,
}

/// Builder for a [`Store`] with non-default collaborators
pub struct StoreBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    estimator: Option<Arc<dyn StorageEstimator>>,
    in_memory: bool,
}

impl StoreBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn estimator(mut self, estimator: impl StorageEstimator + 'static) -> Self {
        self.estimator = Some(Arc::new(estimator));
        self
    }

    /// Keep the database in memory (nothing touches the data directory)
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn open(self) -> StoreResult<Store> {
        let db = if self.in_memory {
            Database::open_in_memory()?
        } else {
            Database::open(&self.config)?
        };

        let estimator = self.estimator.unwrap_or_else(|| {
            Arc::new(DirectoryEstimator::new(
                self.config.data_dir.clone(),
                self.config.quota.local_quota_bytes(),
            ))
        });

        let last_stamp = rows::latest_stamp(db.connection())?.map(from_micros);
        let policy = EvictionPolicy::new(self.config.cache.capacity, self.config.cache.ttl());

        tracing::debug!(path = ?db.path(), "Opened store");

        Ok(Store {
            db,
            config: self.config,
            clock: self.clock,
            events: self.events,
            estimator: estimator.clone(),
            guard: QuotaGuard::new(estimator),
            policy,
            stamper: Stamper::resume_after(last_stamp),
        })
    }
}

/// Unified storage interface for Airis
pub struct Store {
    pub(crate) db: Database,
    config: Config,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    estimator: Arc<dyn StorageEstimator>,
    guard: QuotaGuard,
    pub(crate) policy: EvictionPolicy,
    stamper: Stamper,
}

/// A row write inside the single write path
struct RowWrite {
    kind: EntityKind,
    table: &'static str,
    id: String,
    book_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payload: String,
    /// Local writes are dirty; writes applied from the remote are not
    dirty: bool,
}

/// What a delete removed
#[derive(Debug, Default)]
struct Removed {
    existed: bool,
    notes: Vec<String>,
    positions: Vec<String>,
    bookmarks: Vec<String>,
}

impl Store {
    /// Open the store with the system clock, a fresh event bus and a
    /// data-directory estimator
    pub fn open(config: Config) -> StoreResult<Self> {
        Self::builder(config).open()
    }

    pub fn builder(config: Config) -> StoreBuilder {
        StoreBuilder {
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(EventBus::new()),
            estimator: None,
            in_memory: false,
        }
    }

    /// Wrap the store for sharing with background tasks
    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn estimator(&self) -> Arc<dyn StorageEstimator> {
        self.estimator.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ==================== Entity Operations ====================

    /// Get a record by id
    pub fn get<T: Record>(&self, id: Uuid) -> StoreResult<T> {
        self.find(id)?
            .ok_or_else(|| StoreError::not_found(T::KIND, id))
    }

    /// Get a record by id, if it exists
    pub fn find<T: Record>(&self, id: Uuid) -> StoreResult<Option<T>> {
        Ok(self.find_row::<T>(&id.to_string())?.map(|(_, record)| record))
    }

    /// Insert or update a record
    ///
    /// Assigns an id when it is nil and `created_at` on first insert, and
    /// always refreshes `updated_at`. Returns the record as stored.
    pub fn put<T: Record>(&mut self, mut record: T) -> StoreResult<T> {
        if record.id().is_nil() {
            record.set_id(Uuid::new_v4());
        }
        let id = record.id().to_string();
        let previous = self.find_row::<T>(&id)?;

        let floor = previous.as_ref().map(|(row, _)| from_micros(row.updated_at));
        let stamp = self.stamper.next(self.clock.now(), floor);
        match previous {
            Some((ref row, _)) => record.set_created_at(from_micros(row.created_at)),
            None => record.set_created_at(stamp),
        }
        record.set_updated_at(stamp);

        self.validate(&record, previous.as_ref().map(|(_, p)| p))?;

        let write = RowWrite {
            kind: T::KIND,
            table: T::TABLE,
            id,
            book_id: record.book_id().map(|b| b.to_string()),
            created_at: record.created_at(),
            updated_at: stamp,
            payload: encode(T::KIND, &record)?,
            dirty: true,
        };
        self.commit(write)?;

        tracing::debug!(kind = %T::KIND, id = %record.id(), "Stored record");
        self.events.publish(record.saved_event(previous.is_none()));
        Ok(record)
    }

    /// Delete a record
    ///
    /// Deleting an unknown id is not an error. Deleting a book also deletes
    /// its notes, reading positions, bookmarks and cached summaries.
    pub fn delete<T: Record>(&mut self, id: Uuid) -> StoreResult<()> {
        self.remove::<T>(&id.to_string(), true)?;
        Ok(())
    }

    /// Records of one kind ordered by `created_at` ascending
    pub fn list<T: Record>(&self, filter: &ListFilter) -> StoreResult<Vec<T>> {
        let book_id = filter.book_id.map(|id| id.to_string());
        let stored = rows::list_rows(self.db.connection(), T::TABLE, book_id.as_deref())?;

        let mut records = Vec::with_capacity(stored.len());
        for row in &stored {
            let record: T = decode(T::TABLE, row)?;
            if let Some(ref query) = filter.query {
                if !record.matches_query(query) {
                    continue;
                }
            }
            records.push(record);
            if filter.limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
        }
        Ok(records)
    }

    /// Books whose title or author contains `query`
    pub fn search_books(&self, query: &str) -> StoreResult<Vec<Book>> {
        self.list(&ListFilter::matching(query))
    }

    pub fn notes_for_book(&self, book_id: Uuid) -> StoreResult<Vec<Note>> {
        self.list(&ListFilter::for_book(book_id))
    }

    /// Notes whose content or tags contain `query`, optionally only in one
    /// book
    pub fn search_notes(&self, query: &str, book_id: Option<Uuid>) -> StoreResult<Vec<Note>> {
        self.list(&ListFilter {
            book_id,
            query: Some(query.to_string()),
            limit: None,
        })
    }

    /// Bookmark a location in a book
    pub fn add_bookmark(
        &mut self,
        book_id: Uuid,
        name: &str,
        location: Location,
    ) -> StoreResult<Bookmark> {
        self.put(Bookmark::new(book_id, name, location))
    }

    pub fn bookmarks_for_book(&self, book_id: Uuid) -> StoreResult<Vec<Bookmark>> {
        self.list(&ListFilter::for_book(book_id))
    }

    /// Most recently written reading position for a book
    pub fn latest_position(&self, book_id: Uuid) -> StoreResult<Option<ReadingPosition>> {
        let positions: Vec<ReadingPosition> = self.list(&ListFilter::for_book(book_id))?;
        Ok(positions.into_iter().max_by_key(|p| p.timestamp))
    }

    /// Record where the reader is in a book
    ///
    /// Updates the book's current position, creating it on first use.
    pub fn set_position(&mut self, book_id: Uuid, location: Location) -> StoreResult<ReadingPosition> {
        let position = match self.latest_position(book_id)? {
            Some(mut position) => {
                position.location = location;
                position
            }
            None => ReadingPosition::new(book_id, location),
        };
        self.put(position)
    }

    // ==================== Preferences ====================

    /// The stored preferences, or defaults when none were saved
    pub fn preferences(&self) -> StoreResult<UserPreferences> {
        match rows::get_row(self.db.connection(), PREFERENCES_TABLE, UserPreferences::ID)? {
            Some(row) => decode(PREFERENCES_TABLE, &row),
            None => Ok(UserPreferences::default()),
        }
    }

    /// Merge a partial update onto the current preferences
    pub fn update_preferences(&mut self, patch: &PreferencesPatch) -> StoreResult<UserPreferences> {
        let mut preferences = self.preferences()?;
        preferences.apply(patch);
        self.save_preferences(preferences)
    }

    /// Restore every preference to its default
    pub fn reset_preferences(&mut self) -> StoreResult<UserPreferences> {
        self.save_preferences(UserPreferences::default())
    }

    fn save_preferences(&mut self, mut preferences: UserPreferences) -> StoreResult<UserPreferences> {
        let previous = rows::get_row(self.db.connection(), PREFERENCES_TABLE, UserPreferences::ID)?;
        let floor = previous.as_ref().map(|row| from_micros(row.updated_at));
        let stamp = self.stamper.next(self.clock.now(), floor);

        preferences.created_at = previous
            .as_ref()
            .map(|row| from_micros(row.created_at))
            .unwrap_or(stamp);
        preferences.updated_at = stamp;
        preferences
            .validate()
            .map_err(|e| StoreError::validation(EntityKind::Preferences, e))?;

        self.commit(RowWrite {
            kind: EntityKind::Preferences,
            table: PREFERENCES_TABLE,
            id: UserPreferences::ID.to_string(),
            book_id: None,
            created_at: preferences.created_at,
            updated_at: stamp,
            payload: encode(EntityKind::Preferences, &preferences)?,
            dirty: true,
        })?;

        tracing::debug!("Stored preferences");
        self.events
            .publish(StoreEvent::PreferencesUpdated(preferences.clone()));
        Ok(preferences)
    }

    // ==================== Remote Writes ====================

    /// Apply a record received from the remote
    ///
    /// Keeps the remote timestamps, re-validates, publishes the usual event
    /// and leaves the row confirmed (not pending sync).
    pub fn apply_remote<T: Record>(&mut self, mut record: T) -> StoreResult<T> {
        record.set_created_at(truncate_micros(record.created_at()));
        record.set_updated_at(truncate_micros(record.updated_at()));

        let id = record.id().to_string();
        let previous = self.find_row::<T>(&id)?;
        self.validate(&record, previous.as_ref().map(|(_, p)| p))?;

        self.commit(RowWrite {
            kind: T::KIND,
            table: T::TABLE,
            id,
            book_id: record.book_id().map(|b| b.to_string()),
            created_at: record.created_at(),
            updated_at: record.updated_at(),
            payload: encode(T::KIND, &record)?,
            dirty: false,
        })?;

        tracing::debug!(kind = %T::KIND, id = %record.id(), "Applied remote record");
        self.events.publish(record.saved_event(previous.is_none()));
        Ok(record)
    }

    /// Apply preferences received from the remote
    pub fn apply_remote_preferences(
        &mut self,
        mut preferences: UserPreferences,
    ) -> StoreResult<UserPreferences> {
        preferences.created_at = truncate_micros(preferences.created_at);
        preferences.updated_at = truncate_micros(preferences.updated_at);
        preferences
            .validate()
            .map_err(|e| StoreError::validation(EntityKind::Preferences, e))?;

        self.commit(RowWrite {
            kind: EntityKind::Preferences,
            table: PREFERENCES_TABLE,
            id: UserPreferences::ID.to_string(),
            book_id: None,
            created_at: preferences.created_at,
            updated_at: preferences.updated_at,
            payload: encode(EntityKind::Preferences, &preferences)?,
            dirty: false,
        })?;

        self.events
            .publish(StoreEvent::PreferencesUpdated(preferences.clone()));
        Ok(preferences)
    }

    /// Apply a deletion received from the remote
    ///
    /// No tombstone is written since the remote already knows.
    pub fn apply_remote_delete(&mut self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        match kind {
            EntityKind::Book => self.remove::<Book>(id, false),
            EntityKind::Note => self.remove::<Note>(id, false),
            EntityKind::Position => self.remove::<ReadingPosition>(id, false),
            EntityKind::Bookmark => self.remove::<Bookmark>(id, false),
            EntityKind::Preferences | EntityKind::Summary => Ok(false),
        }
    }

    // ==================== Sync Bookkeeping ====================

    /// Unconfirmed local writes and deletions in write order
    pub fn pending_changes(&self, limit: usize) -> StoreResult<Vec<PendingChange>> {
        let conn = self.db.connection();
        let mut changes = Vec::new();

        for kind in SYNCED_KINDS {
            if let Some(table) = table_for(kind) {
                for row in rows::dirty_rows(conn, table, limit)? {
                    changes.push(PendingChange {
                        kind,
                        id: row.id,
                        seq: row.seq,
                        deleted_at: None,
                    });
                }
            }
        }
        for tombstone in rows::dirty_tombstones(conn, limit)? {
            changes.push(tombstone_change(tombstone));
        }

        changes.sort_by_key(|c| c.seq);
        changes.truncate(limit);
        Ok(changes)
    }

    /// Number of unconfirmed local writes and deletions
    pub fn pending_count(&self) -> StoreResult<usize> {
        let conn = self.db.connection();
        let mut count = rows::count_tombstones(conn)?;
        for kind in SYNCED_KINDS {
            if let Some(table) = table_for(kind) {
                count += rows::count_dirty(conn, table)?;
            }
        }
        Ok(count)
    }

    /// Current pending state of one entity, if it still awaits sync
    pub fn pending_change(&self, kind: EntityKind, id: &str) -> StoreResult<Option<PendingChange>> {
        let Some(table) = table_for(kind) else {
            return Ok(None);
        };
        let conn = self.db.connection();

        if let Some(row) = rows::get_row(conn, table, id)? {
            return Ok(row.dirty.then(|| PendingChange {
                kind,
                id: row.id,
                seq: row.seq,
                deleted_at: None,
            }));
        }
        Ok(rows::get_tombstone(conn, kind, id)?.map(tombstone_change))
    }

    /// Mark a pushed change as confirmed
    ///
    /// Has no effect when the entity was written again after `change` was
    /// read; the newer write stays pending.
    pub fn confirm_change(&mut self, change: &PendingChange) -> StoreResult<bool> {
        let conn = self.db.connection();
        if change.is_deletion() {
            return Ok(rows::confirm_tombstone(conn, change.kind, &change.id, change.seq)?);
        }
        match table_for(change.kind) {
            Some(table) => Ok(rows::mark_clean(conn, table, &change.id, change.seq)?),
            None => Ok(false),
        }
    }

    /// Local `updated_at` (or deletion time) of an entity
    pub fn local_updated_at(&self, kind: EntityKind, id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(table) = table_for(kind) else {
            return Ok(None);
        };
        let conn = self.db.connection();
        if let Some(row) = rows::get_row(conn, table, id)? {
            return Ok(Some(from_micros(row.updated_at)));
        }
        Ok(rows::get_tombstone(conn, kind, id)?.map(|t| from_micros(t.deleted_at)))
    }

    /// The sync watermark: server time of the last fully confirmed sync
    pub fn last_synced_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let value = rows::get_meta(self.db.connection(), keys::LAST_SYNCED_AT)?;
        Ok(value
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_micros))
    }

    pub fn set_last_synced_at(&mut self, at: DateTime<Utc>) -> StoreResult<()> {
        rows::set_meta(
            self.db.connection(),
            keys::LAST_SYNCED_AT,
            &to_micros(at).to_string(),
        )?;
        Ok(())
    }

    // ==================== Maintenance ====================

    /// Dump books, notes, positions, bookmarks and preferences
    pub fn export_snapshot(&self) -> StoreResult<Snapshot> {
        Ok(Snapshot {
            version: Snapshot::VERSION,
            exported_at: self.clock.now(),
            books: self.list(&ListFilter::default())?,
            notes: self.list(&ListFilter::default())?,
            positions: self.list(&ListFilter::default())?,
            bookmarks: self.list(&ListFilter::default())?,
            preferences: self.preferences()?,
        })
    }

    /// Load a snapshot through the normal write path
    ///
    /// Records keep their ids; every imported record is stamped as a new
    /// local write and will be pushed on the next sync.
    pub fn import_snapshot(&mut self, snapshot: Snapshot) -> StoreResult<ImportReport> {
        let mut report = ImportReport::default();
        for book in snapshot.books {
            self.put(book)?;
            report.books += 1;
        }
        for note in snapshot.notes {
            self.put(note)?;
            report.notes += 1;
        }
        for position in snapshot.positions {
            self.put(position)?;
            report.positions += 1;
        }
        for bookmark in snapshot.bookmarks {
            self.put(bookmark)?;
            report.bookmarks += 1;
        }
        self.save_preferences(snapshot.preferences)?;
        tracing::info!(
            books = report.books,
            notes = report.notes,
            positions = report.positions,
            bookmarks = report.bookmarks,
            "Imported snapshot"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.db.connection();
        Ok(StoreStats {
            books: rows::count_rows(conn, Book::TABLE)?,
            notes: rows::count_rows(conn, Note::TABLE)?,
            positions: rows::count_rows(conn, ReadingPosition::TABLE)?,
            bookmarks: rows::count_rows(conn, Bookmark::TABLE)?,
            summaries: rows::count_summaries(conn)?,
            pending: self.pending_count()?,
            last_synced_at: self.last_synced_at()?,
            estimate: self.estimator.estimate(),
        })
    }

    /// Whether the database answers queries
    pub fn is_healthy(&self) -> bool {
        self.db
            .connection()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // ==================== Internals ====================

    fn find_row<T: Record>(&self, id: &str) -> StoreResult<Option<(EntityRow, T)>> {
        match rows::get_row(self.db.connection(), T::TABLE, id)? {
            Some(row) => {
                let record = decode(T::TABLE, &row)?;
                Ok(Some((row, record)))
            }
            None => Ok(None),
        }
    }

    fn validate<T: Record>(&self, record: &T, previous: Option<&T>) -> StoreResult<()> {
        record
            .validate(&self.config.limits)
            .map_err(|e| StoreError::validation(T::KIND, e))?;
        if let Some(previous) = previous {
            record
                .validate_update(previous)
                .map_err(|e| StoreError::validation(T::KIND, e))?;
        }
        if let Some(book_id) = record.book_id() {
            let book_id = book_id.to_string();
            if rows::get_row(self.db.connection(), Book::TABLE, &book_id)?.is_none() {
                return Err(StoreError::validation(
                    T::KIND,
                    ValidationError::UnknownBook {
                        kind: T::KIND,
                        book_id,
                    },
                ));
            }
        }
        Ok(())
    }

    /// Reject a write that would exceed the hard storage ceiling
    ///
    /// A rejection always publishes a quota warning.
    pub(crate) fn check_quota(&self, requested: u64) -> StoreResult<()> {
        match self.guard.check(requested) {
            Ok(_) => Ok(()),
            Err(err) => {
                if let StoreError::QuotaExceeded { usage, limit, .. } = &err {
                    tracing::warn!(requested, usage, limit, "Write rejected: storage quota exceeded");
                    self.events
                        .publish(StoreEvent::StorageQuotaWarning(StorageEstimate::new(
                            *limit, *usage,
                        )));
                }
                Err(err)
            }
        }
    }

    /// Classify a failed database write and surface it
    pub(crate) fn storage_failure(&self, error: rusqlite::Error) -> StoreError {
        let error = self.db.classify(error);
        if error.is_recoverable() {
            tracing::warn!(error = %error, "Storage write failed");
        } else {
            tracing::error!(error = %error, "Storage write failed");
        }
        if error.is_disk_full() {
            self.events
                .publish(StoreEvent::StorageQuotaWarning(self.estimator.estimate()));
        }
        self.events.publish(StoreEvent::StorageError {
            message: error.to_string(),
        });
        StoreError::Storage(error)
    }

    fn commit(&mut self, write: RowWrite) -> StoreResult<i64> {
        self.check_quota(write.payload.len() as u64)?;
        let outcome = write_row(self.db.connection_mut(), &write);
        outcome.map_err(|e| self.storage_failure(e))
    }

    /// Delete one record, cascading from books
    fn remove<T: Record>(&mut self, id: &str, local: bool) -> StoreResult<bool> {
        let Some((_, record)) = self.find_row::<T>(id)? else {
            return Ok(false);
        };

        let tombstone_at = local.then(|| self.stamper.next(self.clock.now(), None));
        let outcome = delete_rows(self.db.connection_mut(), T::KIND, id, tombstone_at);
        let removed = outcome.map_err(|e| self.storage_failure(e))?;
        if !removed.existed {
            return Ok(false);
        }

        if T::KIND == EntityKind::Book {
            let book_id = record.id();
            for note in removed.notes.iter().filter_map(|id| Uuid::parse_str(id).ok()) {
                self.events
                    .publish(StoreEvent::NoteDeleted { id: note, book_id });
            }
            for position in removed.positions.iter().filter_map(|id| Uuid::parse_str(id).ok()) {
                self.events.publish(StoreEvent::PositionDeleted {
                    id: position,
                    book_id,
                });
            }
            for bookmark in removed.bookmarks.iter().filter_map(|id| Uuid::parse_str(id).ok()) {
                self.events.publish(StoreEvent::BookmarkDeleted {
                    id: bookmark,
                    book_id,
                });
            }
        }

        tracing::debug!(kind = %T::KIND, id, local, "Deleted record");
        self.events.publish(record.deleted_event());
        Ok(true)
    }
}

fn tombstone_change(tombstone: Tombstone) -> PendingChange {
    PendingChange {
        kind: tombstone.kind,
        id: tombstone.id,
        seq: tombstone.seq,
        deleted_at: Some(from_micros(tombstone.deleted_at)),
    }
}

fn encode<T: Serialize>(kind: EntityKind, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Serialization { kind, source })
}

fn decode<T: DeserializeOwned>(collection: &'static str, row: &EntityRow) -> StoreResult<T> {
    serde_json::from_str(&row.payload).map_err(|e| {
        StoreError::Storage(StorageError::CorruptRecord {
            collection,
            id: row.id.clone(),
            details: e.to_string(),
        })
    })
}

// ==================== Transaction helpers ====================

/// Write one entity row, allocating its write sequence
fn write_row(conn: &mut Connection, write: &RowWrite) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;
    let seq = rows::next_seq(&tx)?;
    rows::upsert_row(
        &tx,
        write.table,
        &EntityRow {
            id: write.id.clone(),
            book_id: write.book_id.clone(),
            created_at: to_micros(write.created_at),
            updated_at: to_micros(write.updated_at),
            seq,
            dirty: write.dirty,
            payload: write.payload.clone(),
        },
    )?;
    // A write after a deletion brings the entity back
    rows::remove_tombstone(&tx, write.kind, &write.id)?;
    tx.commit()?;
    Ok(seq)
}

/// Delete an entity (and a book's dependents) in one transaction
///
/// With `tombstone_at` set the deletion is recorded for the next push.
fn delete_rows(
    conn: &mut Connection,
    kind: EntityKind,
    id: &str,
    tombstone_at: Option<DateTime<Utc>>,
) -> rusqlite::Result<Removed> {
    let Some(table) = table_for(kind) else {
        return Ok(Removed::default());
    };

    let tx = conn.transaction()?;
    let mut removed = Removed {
        existed: rows::delete_row(&tx, table, id)?,
        ..Removed::default()
    };

    if removed.existed && kind == EntityKind::Book {
        removed.notes = rows::delete_rows_for_book(&tx, Note::TABLE, id)?;
        removed.positions = rows::delete_rows_for_book(&tx, ReadingPosition::TABLE, id)?;
        removed.bookmarks = rows::delete_rows_for_book(&tx, Bookmark::TABLE, id)?;
        rows::delete_summaries_for_book(&tx, id)?;
    }

    match tombstone_at {
        Some(deleted_at) if removed.existed => {
            let seq = rows::next_seq(&tx)?;
            rows::put_tombstone(
                &tx,
                &Tombstone {
                    kind,
                    id: id.to_string(),
                    deleted_at: to_micros(deleted_at),
                    seq,
                },
            )?;
        }
        Some(_) => {}
        None => rows::remove_tombstone(&tx, kind, id)?,
    }

    tx.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{BookFormat, Summary, Theme};
    use crate::quota::ManualEstimator;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_store() -> (Store, ManualClock) {
        let clock = ManualClock::at_secs(1_700_000_000);
        let store = Store::builder(Config::with_data_dir("/nonexistent/airis"))
            .clock(clock.clone())
            .estimator(ManualEstimator::default())
            .in_memory()
            .open()
            .unwrap();
        (store, clock)
    }

    fn topics(rx: &mut UnboundedReceiver<StoreEvent>) -> Vec<&'static str> {
        let mut topics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            topics.push(event.topic());
        }
        topics
    }

    fn book(store: &mut Store, title: &str) -> Book {
        store
            .put(Book::new(title, BookFormat::Epub).with_file("file:///book.epub", 1024))
            .unwrap()
    }

    #[test]
    fn test_put_assigns_timestamps() {
        let (mut store, clock) = test_store();

        let stored = book(&mut store, "Truyện Kiều");
        assert_eq!(stored.created_at, clock.now());
        assert_eq!(stored.updated_at, stored.created_at);

        clock.advance_secs(10);
        let mut edited = stored.clone();
        edited.title = "Truyện Kiều (bản mới)".to_string();
        let edited = store.put(edited).unwrap();

        assert_eq!(edited.created_at, stored.created_at);
        assert_eq!(edited.updated_at, clock.now());
        assert_eq!(store.get::<Book>(stored.id).unwrap(), edited);
    }

    #[test]
    fn test_put_assigns_missing_id() {
        let (mut store, _clock) = test_store();
        let mut book = Book::new("No id", BookFormat::Txt);
        book.id = Uuid::nil();

        let stored = store.put(book).unwrap();
        assert!(!stored.id.is_nil());
    }

    #[test]
    fn test_updates_in_same_tick_are_strictly_ordered() {
        let (mut store, _clock) = test_store();
        let stored = book(&mut store, "Tick");

        let again = store.put(stored.clone()).unwrap();
        assert!(again.updated_at > stored.updated_at);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let (store, _clock) = test_store();
        let err = store.get::<Note>(Uuid::new_v4()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validation_rejects_and_persists_nothing() {
        let (mut store, _clock) = test_store();
        let mut rx = store.subscribe();

        let too_big = Book::new("Huge", BookFormat::Pdf).with_file("file:///huge.pdf", 51 * 1024 * 1024);
        let err = store.put(too_big).unwrap_err();
        assert!(err.is_validation());

        let orphan = Note::new(Uuid::new_v4(), "Orphan note");
        let err = store.put(orphan).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation {
                source: ValidationError::UnknownBook { .. },
                ..
            }
        ));

        assert_eq!(store.stats().unwrap().books, 0);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert!(topics(&mut rx).is_empty());
    }

    #[test]
    fn test_format_cannot_change() {
        let (mut store, _clock) = test_store();
        let mut stored = book(&mut store, "Format");
        stored.format = BookFormat::Pdf;

        let err = store.put(stored.clone()).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.get::<Book>(stored.id).unwrap().format, BookFormat::Epub);
    }

    #[test]
    fn test_events_follow_writes() {
        let (mut store, _clock) = test_store();
        let mut rx = store.subscribe();

        let stored = book(&mut store, "Events");
        store.put(stored.clone()).unwrap();
        let note = store.put(Note::new(stored.id, "A note")).unwrap();
        store.delete::<Note>(note.id).unwrap();

        assert_eq!(
            topics(&mut rx),
            vec!["book-added", "book-updated", "note-added", "note-deleted"]
        );
    }

    #[test]
    fn test_list_orders_by_created_at_and_filters() {
        let (mut store, clock) = test_store();
        let first = book(&mut store, "Rust in Action");
        clock.advance_secs(1);
        let second = book(&mut store, "Python Crash Course");
        clock.advance_secs(1);
        book(&mut store, "Programming Rust");

        let all: Vec<Book> = store.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);

        let rust = store.search_books("rust").unwrap();
        assert_eq!(rust.len(), 2);

        let limited: Vec<Book> = store.list(&ListFilter::default().limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_notes_for_book_and_search() {
        let (mut store, _clock) = test_store();
        let a = book(&mut store, "A");
        let b = book(&mut store, "B");

        let mut tagged = Note::new(a.id, "First thought");
        tagged.add_tag("quote");
        store.put(tagged).unwrap();
        store.put(Note::new(a.id, "Second thought")).unwrap();
        store.put(Note::new(b.id, "Other book")).unwrap();

        assert_eq!(store.notes_for_book(a.id).unwrap().len(), 2);
        assert_eq!(store.search_notes("QUOTE", None).unwrap().len(), 1);
        assert_eq!(store.search_notes("thought", None).unwrap().len(), 2);
        assert_eq!(store.search_notes("o", None).unwrap().len(), 3);
        assert_eq!(store.search_notes("o", Some(b.id)).unwrap().len(), 1);
        assert!(store.search_notes("thought", Some(b.id)).unwrap().is_empty());
    }

    #[test]
    fn test_bookmarks_belong_to_a_book() {
        let (mut store, _clock) = test_store();
        let b = book(&mut store, "Marked");
        let mut rx = store.subscribe();

        let first = store
            .add_bookmark(b.id, "Đoạn mở đầu", Location::at(0, 0.0))
            .unwrap();
        store
            .add_bookmark(b.id, "Cao trào", Location::at(900, 0.9))
            .unwrap();
        let names: Vec<_> = store
            .bookmarks_for_book(b.id)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Đoạn mở đầu", "Cao trào"]);

        store.delete::<Bookmark>(first.id).unwrap();
        assert_eq!(store.bookmarks_for_book(b.id).unwrap().len(), 1);
        assert_eq!(
            topics(&mut rx),
            vec!["bookmark-added", "bookmark-added", "bookmark-deleted"]
        );

        let orphan = store.add_bookmark(Uuid::new_v4(), "Nowhere", Location::at(0, 0.0));
        assert!(orphan.unwrap_err().is_validation());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (mut store, _clock) = test_store();
        let mut rx = store.subscribe();

        store.delete::<Book>(Uuid::new_v4()).unwrap();
        store.delete::<Book>(Uuid::new_v4()).unwrap();
        assert!(topics(&mut rx).is_empty());
    }

    #[test]
    fn test_book_delete_cascades() {
        let (mut store, clock) = test_store();
        let doomed = book(&mut store, "Doomed");
        let kept = book(&mut store, "Kept");
        store.put(Note::new(doomed.id, "gone")).unwrap();
        store.put(Note::new(kept.id, "stays")).unwrap();
        store.set_position(doomed.id, Location::at(10, 0.1)).unwrap();
        store
            .add_bookmark(doomed.id, "mark", Location::at(5, 0.05))
            .unwrap();

        let mut summary = Summary::new("hash", "text").for_book(doomed.id);
        summary.created_at = clock.now();
        store.admit_summary(summary).unwrap();

        let mut rx = store.subscribe();
        store.delete::<Book>(doomed.id).unwrap();
        store.delete::<Book>(doomed.id).unwrap();

        assert!(store.notes_for_book(doomed.id).unwrap().is_empty());
        assert!(store.latest_position(doomed.id).unwrap().is_none());
        assert!(store.bookmarks_for_book(doomed.id).unwrap().is_empty());
        assert_eq!(store.notes_for_book(kept.id).unwrap().len(), 1);
        assert_eq!(store.cache_stats().unwrap().entries, 0);
        assert_eq!(
            topics(&mut rx),
            vec!["note-deleted", "position-deleted", "bookmark-deleted", "book-deleted"]
        );
    }

    #[test]
    fn test_positions_update_in_place() {
        let (mut store, clock) = test_store();
        let b = book(&mut store, "Progress");

        let first = store.set_position(b.id, Location::at(500, 0.5)).unwrap();
        clock.advance_secs(1);
        let second = store.set_position(b.id, Location::at(100, 0.1)).unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.timestamp > first.timestamp);
        let latest = store.latest_position(b.id).unwrap().unwrap();
        assert_eq!(latest.location.percentage, 0.1);
    }

    #[test]
    fn test_position_percentage_validated() {
        let (mut store, _clock) = test_store();
        let b = book(&mut store, "Bad progress");
        let err = store.set_position(b.id, Location::at(0, 1.2)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_preferences_default_and_patch() {
        let (mut store, _clock) = test_store();
        let mut rx = store.subscribe();

        assert_eq!(store.preferences().unwrap().theme, Theme::Light);

        let updated = store
            .update_preferences(&PreferencesPatch::voice_rate(1.5))
            .unwrap();
        assert_eq!(updated.voice.rate, 1.5);
        assert_eq!(store.preferences().unwrap().voice.rate, 1.5);

        let err = store
            .update_preferences(&PreferencesPatch::voice_rate(3.0))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.preferences().unwrap().voice.rate, 1.5);

        let reset = store.reset_preferences().unwrap();
        assert_eq!(reset.voice.rate, 1.0);
        assert_eq!(reset.created_at, updated.created_at);

        assert_eq!(
            topics(&mut rx),
            vec!["preferences-updated", "preferences-updated"]
        );
    }

    #[test]
    fn test_quota_ceiling_rejects_write_and_warns() {
        let clock = ManualClock::at_secs(1_000);
        let estimator = ManualEstimator::new(StorageEstimate::new(1_000, 999));
        let mut store = Store::builder(Config::with_data_dir("/nonexistent/airis"))
            .clock(clock)
            .estimator(estimator.clone())
            .in_memory()
            .open()
            .unwrap();
        let mut rx = store.subscribe();

        let err = store.put(Book::new("Too much", BookFormat::Txt)).unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(topics(&mut rx), vec!["storage-quota-warning"]);
        assert_eq!(store.stats().unwrap().books, 0);

        estimator.set(StorageEstimate::new(1_000_000, 0));
        assert!(store.put(Book::new("Fits", BookFormat::Txt)).is_ok());
    }

    #[test]
    fn test_pending_changes_and_confirm() {
        let (mut store, _clock) = test_store();
        let a = book(&mut store, "A");
        let b = book(&mut store, "B");
        store.delete::<Book>(b.id).unwrap();

        let pending = store.pending_changes(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id.to_string());
        assert!(pending[1].is_deletion());

        let limited = store.pending_changes(1).unwrap();
        assert_eq!(limited.len(), 1);

        // A write after the change was read keeps it pending
        let stale = pending[0].clone();
        store.put(a.clone()).unwrap();
        assert!(!store.confirm_change(&stale).unwrap());

        let fresh = store
            .pending_change(EntityKind::Book, &a.id.to_string())
            .unwrap()
            .unwrap();
        assert!(store.confirm_change(&fresh).unwrap());
        assert!(store.confirm_change(&pending[1]).unwrap());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_rewrite_after_delete_drops_tombstone() {
        let (mut store, _clock) = test_store();
        let a = book(&mut store, "Back again");
        store.delete::<Book>(a.id).unwrap();
        store.put(a.clone()).unwrap();

        let pending = store.pending_changes(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].is_deletion());
    }

    #[test]
    fn test_apply_remote_keeps_timestamps_and_is_not_pending() {
        let (mut store, _clock) = test_store();
        let mut rx = store.subscribe();

        let mut remote = Book::new("From server", BookFormat::Pdf);
        remote.created_at = DateTime::from_timestamp(100, 0).unwrap();
        remote.updated_at = DateTime::from_timestamp(200, 0).unwrap();
        store.apply_remote(remote.clone()).unwrap();

        let stored = store.get::<Book>(remote.id).unwrap();
        assert_eq!(stored.updated_at, remote.updated_at);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(topics(&mut rx), vec!["book-added"]);
        assert_eq!(
            store
                .local_updated_at(EntityKind::Book, &remote.id.to_string())
                .unwrap(),
            Some(remote.updated_at)
        );
    }

    #[test]
    fn test_local_edit_after_remote_is_newer() {
        let (mut store, _clock) = test_store();

        // Remote stamp far in the future of the local clock
        let mut remote = Book::new("Skewed", BookFormat::Pdf);
        remote.created_at = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        remote.updated_at = remote.created_at;
        store.apply_remote(remote.clone()).unwrap();

        let edited = store.put(remote.clone()).unwrap();
        assert!(edited.updated_at > remote.updated_at);
    }

    #[test]
    fn test_apply_remote_delete_writes_no_tombstone() {
        let (mut store, _clock) = test_store();
        let a = book(&mut store, "Remote delete");
        let pending = store.pending_change(EntityKind::Book, &a.id.to_string()).unwrap().unwrap();
        store.confirm_change(&pending).unwrap();

        assert!(store
            .apply_remote_delete(EntityKind::Book, &a.id.to_string())
            .unwrap());
        assert_eq!(store.pending_count().unwrap(), 0);
        assert!(store.find::<Book>(a.id).unwrap().is_none());
    }

    #[test]
    fn test_watermark_round_trip() {
        let (mut store, _clock) = test_store();
        assert!(store.last_synced_at().unwrap().is_none());

        let at = DateTime::from_timestamp(1_700_000_123, 456_000).unwrap();
        store.set_last_synced_at(at).unwrap();
        assert_eq!(store.last_synced_at().unwrap(), Some(at));
    }

    #[test]
    fn test_export_import_round_trip() {
        let (mut store, _clock) = test_store();
        let b = book(&mut store, "Exported");
        store.put(Note::new(b.id, "Exported note")).unwrap();
        store.set_position(b.id, Location::at(5, 0.05)).unwrap();
        store
            .add_bookmark(b.id, "Here", Location::at(5, 0.05))
            .unwrap();
        store
            .update_preferences(&PreferencesPatch {
                theme: Some(Theme::Dark),
                ..PreferencesPatch::default()
            })
            .unwrap();

        let snapshot = store.export_snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();

        let (mut other, _clock) = test_store();
        let report = other
            .import_snapshot(serde_json::from_str(&json).unwrap())
            .unwrap();

        assert_eq!(
            report,
            ImportReport {
                books: 1,
                notes: 1,
                positions: 1,
                bookmarks: 1,
            }
        );
        assert_eq!(other.get::<Book>(b.id).unwrap().title, "Exported");
        assert_eq!(other.bookmarks_for_book(b.id).unwrap()[0].name, "Here");
        assert_eq!(other.preferences().unwrap().theme, Theme::Dark);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());

        let id = {
            let mut store = Store::open(config.clone()).unwrap();
            let b = store
                .put(Book::new("Persistent", BookFormat::Txt))
                .unwrap();
            store
                .update_preferences(&PreferencesPatch::voice_rate(0.75))
                .unwrap();
            b.id
        };

        let mut store = Store::open(config).unwrap();
        let reopened = store.get::<Book>(id).unwrap();
        assert_eq!(reopened.title, "Persistent");
        assert_eq!(store.preferences().unwrap().voice.rate, 0.75);
        assert!(store.is_healthy());

        // Stamps keep increasing across restarts
        let again = store.put(reopened.clone()).unwrap();
        assert!(again.updated_at > reopened.updated_at);
    }

    #[test]
    fn test_stats() {
        let (mut store, _clock) = test_store();
        let b = book(&mut store, "Stats");
        store.put(Note::new(b.id, "n")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.books, 1);
        assert_eq!(stats.notes, 1);
        assert_eq!(stats.pending, 2);
        assert!(stats.last_synced_at.is_none());
    }
}
