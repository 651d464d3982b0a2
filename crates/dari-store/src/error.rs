use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error that is not a transient lock conflict.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// The store cannot serve the request right now (busy, locked, offline).
    /// Safe to retry with backoff.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The authenticated session may not perform this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The addressed document does not exist.
    #[error("Document not found")]
    NotFound,

    /// A conditional update found the document in an unexpected state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Malformed collection path or document id.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A stored document body is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timestamp column could not be parsed.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A thread panicked while holding the store lock.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
