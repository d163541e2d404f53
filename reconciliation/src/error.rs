//! Error types for the reconciliation engine

use ledger_core::{CharityRef, RailKind};
use thiserror::Error;
use uuid::Uuid;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Rail adapter error
    #[error("Adapter error: {0}")]
    Adapter(#[from] rail_adapters::Error),

    /// Projector error
    #[error("Projector error: {0}")]
    Projector(#[from] impact_projector::Error),

    /// No finality rule configured for the rail
    #[error("No finality policy for rail {0}")]
    MissingFinalityPolicy(RailKind),

    /// Pending queue at capacity
    #[error("Pending queue full (capacity {capacity})")]
    PendingQueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Unknown schedule
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// Schedule state machine refused the action
    #[error("Invalid transition for schedule {schedule_id}: {from} -> {action}")]
    InvalidTransition {
        /// Schedule
        schedule_id: Uuid,
        /// Current state
        from: String,
        /// Requested action
        action: &'static str,
    },

    /// Schedule request rejected by validation
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Charity unknown to the directory
    #[error("Charity not found: {0}")]
    CharityNotFound(CharityRef),

    /// Charity exists but is not verified
    #[error("Charity not verified: {0}")]
    UnverifiedCharity(CharityRef),

    /// Category outside the directory's list
    #[error("Invalid category `{0}`")]
    InvalidCategory(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
