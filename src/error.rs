//! Crate-wide error type
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("event malformed: {0}")]
    MalformedEvent(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("filter set rejected by admission gate")]
    AdmissionRejected,

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("duplicate")]
    Duplicate,

    #[error("storage busy, retry")]
    StorageBusy,

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("database directory does not exist")]
    DatabaseDirError,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// `true` for the small set of conditions the write path will retry a
    /// bounded number of times before giving up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StorageBusy => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }

    /// `true` for errors that indicate the store itself is unusable and the
    /// process should log and abort rather than continue serving requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StorageCorrupt(_))
    }
}

/// §7 policy: `StorageCorrupt` is fatal. Call this wherever a storage
/// result first reaches the connection/HTTP layer so a corrupt database
/// takes the whole process down rather than limping along connection by
/// connection.
pub fn abort_if_fatal(e: &Error) {
    if e.is_fatal() {
        tracing::error!("fatal storage error, aborting: {e}");
        std::process::exit(1);
    }
}
