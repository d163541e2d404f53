//! Error types for the projector

use thiserror::Error;

/// Result type for projector operations
pub type Result<T> = std::result::Result<T, Error>;

/// Projector errors
#[derive(Error, Debug)]
pub enum Error {
    /// Entry skipped ahead of the projection
    #[error("Sequence gap: expected {expected}, got {found}")]
    SequenceGap {
        /// Next sequence the projection can accept
        expected: u64,
        /// Sequence that arrived
        found: u64,
    },

    /// Ledger read failed during replay
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Notification could not be delivered
    #[error("Notification error: {0}")]
    Notification(String),
}
