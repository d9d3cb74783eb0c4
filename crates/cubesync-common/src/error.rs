//! Error types shared across cube-sync crates

use thiserror::Error;

/// Result type alias for shared cube-sync operations
pub type Result<T> = std::result::Result<T, CubeSyncError>;

/// Errors raised by the shared model and configuration helpers
#[derive(Error, Debug)]
pub enum CubeSyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl CubeSyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
