//! Storage layer
//!
//! Durable keyed collections on SQLite: one table per entity kind, a
//! tombstone table for unconfirmed deletions, the summary cache and a
//! metadata record. The [`Store`](crate::store::Store) is the only writer.

pub mod collections;
pub mod error;
pub mod schema;

pub use collections::Database;
pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
