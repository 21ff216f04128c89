#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("libsql error: {0}")]
    SQLError(#[from] libsql::Error),
    #[error("unexpected column type in row")]
    SQLInvalidTypeError,
    #[error("database schema version mismatch: got {current}, expected {expected}")]
    VersionMismatch { current: u64, expected: u64 },
    #[error("stored value could not be decoded: {0}")]
    Corrupted(String),
    #[error("{0}")]
    Custom(String),
}
