//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, TokenMediaError>;

/// Main error type for value parsing and shared utilities
#[derive(Error, Debug)]
pub enum TokenMediaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported chain: {0}")]
    InvalidChain(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid token id: {0}")]
    InvalidTokenId(String),

    #[error("Unknown media type: {0}")]
    InvalidMediaType(String),

    #[error("Invalid token metadata: {0}")]
    InvalidMetadata(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
