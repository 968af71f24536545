//! Store error types
//!
//! Validation and not-found failures are local and meant to be handled at
//! the call site. Quota failures always surface. Storage failures wrap
//! [`StorageError`].

use thiserror::Error;

use crate::models::EntityKind;
use crate::storage::StorageError;

/// An entity failed one of its invariants
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is {value}, expected a value in [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("file size {size} bytes exceeds the maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("book format cannot change after creation (was {from}, got {to})")]
    FormatChanged { from: String, to: String },

    #[error("{kind} references unknown book {book_id}")]
    UnknownBook { kind: EntityKind, book_id: String },

    #[error("updated_at is earlier than created_at")]
    TimestampOrder,

    #[error("{field} is not a valid value: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Errors returned by the entity store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Entity rejected by its invariants; never sent to sync
    #[error("Invalid {kind}: {source}")]
    Validation {
        kind: EntityKind,
        #[source]
        source: ValidationError,
    },

    /// Read of an unknown id
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// The write would push storage past the hard ceiling
    #[error("Storage quota exceeded: writing {requested} bytes with {usage} of {limit} bytes used")]
    QuotaExceeded { requested: u64, usage: u64, limit: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to encode {kind}: {source}")]
    Serialization {
        kind: EntityKind,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn validation(kind: EntityKind, source: ValidationError) -> Self {
        StoreError::Validation { kind, source }
    }

    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation { .. })
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
            || matches!(self, StoreError::Storage(e) if e.is_disk_full())
    }

    /// What the user can do about this error, if anything
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::QuotaExceeded { .. } => {
                Some("Clear the summary cache or delete books you no longer need.")
            }
            StoreError::Storage(e) => e.recovery_suggestion(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::Storage(StorageError::Database(error))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
