//! Synchronization with the remote API
//!
//! The local store is the source of truth while offline. Every local write
//! is marked pending; the [`SyncEngine`] pushes pending changes, pulls
//! remote ones since the last watermark and resolves conflicts
//! last-write-wins on `updated_at`.
//!
//! ## Usage
//!
//! ```ignore
//! let remote = Arc::new(HttpRemote::new(url, token, Duration::from_secs(30))?);
//! let engine = Arc::new(SyncEngine::new(store.clone(), remote).await);
//!
//! let handle = spawn_sync_task(engine, config.sync.interval());
//! handle.sync_now().await;
//! handle.shutdown().await;
//! ```

mod engine;
mod remote;
mod resolve;
mod retry;

pub use engine::{
    spawn_sync_task, SyncCommand, SyncEngine, SyncError, SyncHandle, SyncOutcome, SyncPhase,
    SyncReport,
};
pub use remote::{
    AckStatus, HttpRemote, PushAck, PushRequest, PushResponse, RemoteApi, RemoteChanges,
    RemoteError, SyncRecord,
};
pub use resolve::{resolve, Resolution};
pub use retry::{OperationClass, RetryPolicy};
