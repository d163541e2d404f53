//! Error types for rail adapters

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter errors
#[derive(Error, Debug)]
pub enum Error {
    /// Required fields absent or unparseable; drop and log, never retry
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Currency not recognized for this rail; needs manual mapping
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Rail temporarily unreachable; safe to retry
    #[error("Transient rail error: {0}")]
    Transient(String),

    /// Charge attempt rejected by the processor
    #[error("Charge failed: {0}")]
    ChargeFailed(String),

    /// Cursor outside the feed
    #[error("Invalid cursor {cursor} (feed length {len})")]
    InvalidCursor {
        /// Requested cursor
        cursor: u64,
        /// Feed length
        len: u64,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
