//! Checkpoint error types.

use thiserror::Error;

/// Errors that can occur during snapshot and restore
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Serialization to JSON or binary format failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Deserialization from JSON or binary format failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Snapshot version is not supported by this version
    #[error("Unsupported snapshot version {found}, supported: {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// A restored machine collides with a live one
    #[error("Restore conflict: {0}")]
    Conflict(String),
}

impl From<bincode::Error> for CheckpointError {
    fn from(error: bincode::Error) -> Self {
        Self::DeserializationFailed(error.to_string())
    }
}
