//! Storage error handling
//!
//! Provides typed errors for the durable collections with descriptive
//! messages and recovery suggestions.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or the database hit its size limit
    #[error("Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again.")]
    DiskFull { path: PathBuf },

    /// Failed to open the database file
    #[error("Failed to open database '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored row could not be decoded
    #[error("Corrupt {collection} record '{id}': {details}")]
    CorruptRecord {
        collection: &'static str,
        id: String,
        details: String,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull { path },
            _ => StorageError::Io(error),
        }
    }

    /// Create an error for a data directory that could not be created
    ///
    /// Permission and disk-full failures keep their own variants.
    pub fn create_directory(error: io::Error, path: PathBuf) -> Self {
        match StorageError::from_io(error, path.clone()) {
            StorageError::Io(source) => StorageError::CreateDirectory { path, source },
            classified => classified,
        }
    }

    /// Create an error for a database file that could not be opened
    pub fn open(error: rusqlite::Error, path: PathBuf) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::DiskFull { path },
            Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly) => {
                StorageError::PermissionDenied {
                    source: io::Error::new(io::ErrorKind::PermissionDenied, error.to_string()),
                    path,
                }
            }
            _ => StorageError::Open {
                path,
                source: error,
            },
        }
    }

    /// Create an error from a SQLite error with path context
    ///
    /// SQLITE_FULL is surfaced as `DiskFull` so callers can treat it as a
    /// quota condition rather than a generic database failure.
    pub fn from_sqlite(error: rusqlite::Error, path: PathBuf) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::DiskFull { path },
            _ => StorageError::Database(error),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. } | StorageError::PermissionDenied { .. }
        )
    }

    /// Check if this error means storage ran out of space
    pub fn is_disk_full(&self) -> bool {
        matches!(self, StorageError::DiskFull { .. })
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => {
                Some("Free up disk space or clear the summary cache and try again.")
            }
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::CorruptRecord { .. } => {
                Some("Export your data, remove the database file, and import the export.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(err.is_disk_full());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_sqlite_full_is_disk_full() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        let err = StorageError::from_sqlite(sqlite_err, PathBuf::from("/data/airis.db"));
        assert!(err.is_disk_full());
    }

    #[test]
    fn test_other_sqlite_errors_pass_through() {
        let err = StorageError::from_sqlite(
            rusqlite::Error::QueryReturnedNoRows,
            PathBuf::from("/data/airis.db"),
        );
        assert!(matches!(err, StorageError::Database(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_create_directory_keeps_permission_errors() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::create_directory(denied, PathBuf::from("/root/airis"));
        assert!(matches!(err, StorageError::PermissionDenied { .. }));

        let other = io::Error::new(io::ErrorKind::NotFound, "no parent");
        let err = StorageError::create_directory(other, PathBuf::from("/missing/airis"));
        assert!(matches!(err, StorageError::CreateDirectory { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_corrupt_record_display() {
        let err = StorageError::CorruptRecord {
            collection: "books",
            id: "abc".to_string(),
            details: "missing field `title`".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("books"));
        assert!(msg.contains("abc"));
        assert!(err.recovery_suggestion().is_some());
    }
}
