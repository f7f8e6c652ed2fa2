//! Error types for pcp-core

use thiserror::Error;

/// Main error type for the pcp-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The backing store could not be reached (network, timeout, 5xx)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The backing store rejected the request
    #[error("store error: {0}")]
    Store(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Stoppage not found
    #[error("stoppage not found: {0}")]
    StoppageNotFound(String),

    /// Stoppage reason not found (or inactive)
    #[error("stoppage reason not found: {0}")]
    ReasonNotFound(String),

    /// The session already has an unresolved stoppage
    #[error("session {0} already has an open stoppage")]
    StoppageAlreadyOpen(String),

    /// The machine plate already has a session in progress
    #[error("plate {plate} of machine {machine_id} already has a session in progress")]
    SessionAlreadyActive { machine_id: String, plate: u32 },

    /// Operation requires a session in progress
    #[error("session {0} is not in progress")]
    SessionNotInProgress(String),

    /// The session already has a record in the export queue
    #[error("session {0} is already queued for export")]
    ExportAlreadyQueued(String),

    /// Missing or malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// True for failures where retrying on the next poll cycle may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for pcp-core
pub type Result<T> = std::result::Result<T, Error>;
