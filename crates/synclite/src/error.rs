use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync rule group not found: {0}")]
    GroupNotFound(i64),

    #[error("sync rule group {0} is stopped")]
    GroupStopped(i64),

    #[error("a batch is already open for group {0}")]
    BatchOpen(i64),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether this error is a transient storage condition worth retrying
    /// (SQLITE_BUSY / SQLITE_LOCKED from a concurrent connection).
    pub fn is_busy(&self) -> bool {
        match self {
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
