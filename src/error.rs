//! Error types for the rowstore storage engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of stream: {0}")]
    UnexpectedEof(String),

    // Configuration / compatibility errors
    #[error("Incompatible configuration: {0}")]
    Incompatible(String),

    #[error("Duplicate table id: {0}")]
    DuplicateTableId(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Bounds errors
    #[error("Row index {index} out of range (row count {row_count})")]
    OutOfRange { index: u64, row_count: u64 },

    // Ordering violations
    #[error("Rows not sorted: {0}")]
    NotSorted(String),

    // Keystone divergence (a writer bypassed the cache)
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("File already exists: {0}")]
    FileExists(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
