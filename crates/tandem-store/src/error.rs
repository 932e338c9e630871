use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No platform data directory for the call database")]
    NoDataDir,

    #[error("Database directory: {0}")]
    Io(#[from] std::io::Error),

    /// No call or user with the requested id.
    #[error("Record not found")]
    NotFound,

    /// A uniqueness constraint rejected the write, e.g. a second active
    /// call for the same pair.
    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Map constraint violations to [`StoreError::Conflict`].
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.unwrap_or_else(|| "constraint violation".to_string()))
            }
            other => StoreError::Sqlite(other),
        }
    }

    pub(crate) fn from_lookup(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        }
    }
}
