//! Error types for shardopt

use thiserror::Error;

/// Result type alias using shardopt's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sharding, checkpointing and resharding.
///
/// Every variant is fatal for the save/load call that produced it. Because
/// collectives require symmetric participation, a rank that hits one of
/// these must abort the whole checkpoint operation rather than retry.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Size mismatch in {what}: expected {expected}, got {got}")]
    SizeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Unknown param state sharding type: {0}")]
    UnknownEncoding(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("Internal consistency error: {0}")]
    Internal(String),

    #[error("Collective failed: {0}")]
    Comm(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::SizeMismatch`].
    pub fn size_mismatch(what: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::SizeMismatch {
            what: what.into(),
            expected,
            got,
        }
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}
