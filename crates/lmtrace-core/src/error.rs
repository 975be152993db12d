//! Core error types.

use thiserror::Error;

/// Errors produced by the core data model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blob identity string did not match the `{type}-{hex}` shape.
    #[error("malformed blob id: {0}")]
    MalformedBlobId(String),
}
