//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Compensation without a prior confirmed entry
    #[error("Out-of-order compensation: {0}")]
    OutOfOrderCompensation(String),

    /// Posting rejected by validation
    #[error("Invalid posting: {0}")]
    InvalidPosting(String),

    /// Posting disagrees with the donation it targets
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    /// Donation not found
    #[error("Donation not found: {0}")]
    DonationNotFound(String),

    /// Hash chain verification failed
    #[error("Audit chain broken at sequence {sequence}: {reason}")]
    ChainBroken {
        /// First sequence that failed verification
        sequence: u64,
        /// Reason
        reason: String,
    },

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
