//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input detected before any I/O happens (unsupported format, unknown extension)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Every acquisition strategy failed on a permission-class error
    #[error("Locked resource {}: {}", .path.display(), .detail)]
    LockedResource { path: PathBuf, detail: String },

    /// Non-permission I/O failure during a copy; never retried
    #[error("I/O error on {}: {}", .path.display(), .detail)]
    TransientIo { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
