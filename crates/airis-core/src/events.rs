//! Store events
//!
//! Every committed mutation, quota warning, storage failure and sync
//! transition is published on the [`EventBus`]. Subscribers receive events in
//! publication order and are never dropped for being slow.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{Book, Bookmark, Note, ReadingPosition, UserPreferences};
use crate::quota::StorageEstimate;

/// Events published by the store, the quota monitor and the sync engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum StoreEvent {
    BookAdded(Book),
    BookUpdated(Book),
    BookDeleted { id: Uuid },
    NoteAdded(Note),
    NoteUpdated(Note),
    NoteDeleted { id: Uuid, book_id: Uuid },
    PositionUpdated(ReadingPosition),
    PositionDeleted { id: Uuid, book_id: Uuid },
    BookmarkAdded(Bookmark),
    BookmarkUpdated(Bookmark),
    BookmarkDeleted { id: Uuid, book_id: Uuid },
    PreferencesUpdated(UserPreferences),
    /// Storage crossed the nearly-full threshold
    StorageQuotaWarning(StorageEstimate),
    /// A storage failure was surfaced to the caller
    StorageError { message: String },
    SyncStarted,
    SyncSucceeded { pulled: usize, pushed: usize, conflicts: usize },
    SyncFailed { message: String },
}

impl StoreEvent {
    /// Stable kebab-case name of the event
    pub fn topic(&self) -> &'static str {
        match self {
            StoreEvent::BookAdded(_) => "book-added",
            StoreEvent::BookUpdated(_) => "book-updated",
            StoreEvent::BookDeleted { .. } => "book-deleted",
            StoreEvent::NoteAdded(_) => "note-added",
            StoreEvent::NoteUpdated(_) => "note-updated",
            StoreEvent::NoteDeleted { .. } => "note-deleted",
            StoreEvent::PositionUpdated(_) => "position-updated",
            StoreEvent::PositionDeleted { .. } => "position-deleted",
            StoreEvent::BookmarkAdded(_) => "bookmark-added",
            StoreEvent::BookmarkUpdated(_) => "bookmark-updated",
            StoreEvent::BookmarkDeleted { .. } => "bookmark-deleted",
            StoreEvent::PreferencesUpdated(_) => "preferences-updated",
            StoreEvent::StorageQuotaWarning(_) => "storage-quota-warning",
            StoreEvent::StorageError { .. } => "storage-error",
            StoreEvent::SyncStarted => "sync-started",
            StoreEvent::SyncSucceeded { .. } => "sync-succeeded",
            StoreEvent::SyncFailed { .. } => "sync-failed",
        }
    }

    /// Whether the event reports a change to stored data
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StoreEvent::BookAdded(_)
                | StoreEvent::BookUpdated(_)
                | StoreEvent::BookDeleted { .. }
                | StoreEvent::NoteAdded(_)
                | StoreEvent::NoteUpdated(_)
                | StoreEvent::NoteDeleted { .. }
                | StoreEvent::PositionUpdated(_)
                | StoreEvent::PositionDeleted { .. }
                | StoreEvent::BookmarkAdded(_)
                | StoreEvent::BookmarkUpdated(_)
                | StoreEvent::BookmarkDeleted { .. }
                | StoreEvent::PreferencesUpdated(_)
        )
    }
}

/// Fan-out of [`StoreEvent`]s to any number of subscribers
///
/// Each subscriber owns an unbounded queue, so publishing never blocks and
/// never loses an event. Dropping the receiver unsubscribes.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    ///
    /// The receiver sees every event published after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: StoreEvent) {
        tracing::trace!(topic = event.topic(), "Publishing event");
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<StoreEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
