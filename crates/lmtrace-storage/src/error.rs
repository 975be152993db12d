//! Storage error types for lmtrace-storage.
//!
//! [`StorageError`] covers all anticipated failure modes in the storage
//! layer: SQLite and migration errors, serialization, blob I/O, and
//! entity-not-found variants.

use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blob store I/O failed.
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blob identity was malformed or unknown.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// A definition with the given identity was not found.
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// An invocation with the given id was not found.
    #[error("invocation not found: {0}")]
    InvocationNotFound(String),

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },
}

impl From<lmtrace_core::CoreError> for StorageError {
    fn from(err: lmtrace_core::CoreError) -> Self {
        match err {
            lmtrace_core::CoreError::Serialization(e) => StorageError::Serialization(e),
            lmtrace_core::CoreError::MalformedBlobId(id) => StorageError::BlobNotFound(id),
        }
    }
}
