//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: all frames are pinned")]
    BufferPoolFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disk error: {0}")]
    Disk(String),
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Disk(format!("{:#}", err))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
