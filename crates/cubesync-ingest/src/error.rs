//! Error types for cube-sync ingestion
//!
//! Structural failures (unreadable cube response, bad configuration, failed
//! authentication) surface as errors. Per-row and per-batch problems are
//! recovered inside the transformer and engines and only show up in counts.

use cubesync_common::CubeSyncError;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The XMLA payload lacks the expected axis or cell structure
    #[error("Malformed cube response: {0}")]
    MalformedResponse(String),

    /// The cube server answered with a SOAP fault or an XMLA error message
    #[error("Cube query failed: {0}")]
    QueryFault(String),

    /// A business-key template field had no value after coercion
    #[error("Business key field '{field}' is missing or null")]
    MissingKeyField { field: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] CubeSyncError),
}

impl IngestError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn missing_key_field(field: impl Into<String>) -> Self {
        Self::MissingKeyField {
            field: field.into(),
        }
    }

    /// Build an HTTP error, keeping only the head of a long response body.
    pub fn http(status: u16, body: &str) -> Self {
        Self::Http {
            status,
            body: snippet(body, 500),
        }
    }
}

impl From<quick_xml::Error> for IngestError {
    fn from(err: quick_xml::Error) -> Self {
        Self::MalformedResponse(format!("invalid XML: {}", err))
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn snippet(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
