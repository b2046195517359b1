//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload id: {0}")]
    InvalidId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
