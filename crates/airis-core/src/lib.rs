//! Airis Core Library
//!
//! Offline-first local storage and synchronization for the Airis reader.
//! Books, notes, reading positions and preferences live in a local SQLite
//! database and stay fully usable without a network; a background engine
//! reconciles them with the remote API when it is reachable.
//!
//! # Architecture
//!
//! - **SQLite**: durable keyed collections, one table per entity kind
//! - **Event bus**: every committed mutation is published to subscribers
//! - **Sync engine**: push/pull with last-write-wins and retry/backoff
//!
//! # Quick Start
//!
//! ```text
//! let mut store = Store::open(Config::load()?)?;
//!
//! let book = store.put(Book::new("Truyện Kiều", BookFormat::Epub))?;
//! store.set_position(book.id, Location::at(1200, 0.12))?;
//!
//! let notes = store.notes_for_book(book.id)?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `models`: Books, notes, positions, preferences and summaries
//! - `events`: Change notifications
//! - `quota`: Storage estimates and the quota monitor
//! - `cache`: Summary cache with TTL and capacity eviction
//! - `sync`: Remote API, conflict resolution and the sync engine
//! - `storage`: SQLite persistence
//! - `config`: Application configuration

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod quota;
pub mod storage;
pub mod store;
pub mod sync;

pub use cache::{spawn_sweeper, CacheStats, EvictionPolicy, SweeperHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{StoreError, StoreResult, ValidationError};
pub use events::{EventBus, StoreEvent};
pub use models::{
    Book, BookFormat, Bookmark, EntityKind, Location, Note, PreferencesPatch, ReadingPosition,
    Record, Summary, SummaryOptions, UserPreferences,
};
pub use quota::{QuotaMonitor, StorageEstimate, StorageEstimator};
pub use storage::StorageError;
pub use store::{SharedStore, Store};
pub use sync::{HttpRemote, RemoteApi, SyncEngine, SyncError, SyncOutcome};
