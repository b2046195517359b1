//! Blob store error types.

use thiserror::Error;

/// Blob store operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("path {path:?} is not prefixed by base path {base:?}")]
    OutsideBase { path: String, base: String },

    #[error("offset mismatch: upload is at {expected}, request says {got}")]
    OffsetMismatch { expected: i64, got: i64 },

    #[error("invalid upload length: {0}")]
    InvalidLength(String),

    #[error("stem {stem:?} is too short for {layers} shard layers")]
    ShardTooShort { stem: String, layers: usize },

    #[error("pre-finish hook failed: {0}")]
    HookFailed(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] depot_metadata::MetadataError),

    #[error("sidecar serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for blob store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
