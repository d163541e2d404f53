//! Donation Reconciliation
//!
//! Turns at-least-once, out-of-order rail deliveries into exactly-once
//! ledger postings:
//! - Finality tracking per rail (confirmation depth, settlement windows)
//! - Bounded pending queue with periodic recheck and expiry into review
//! - Charity verification before any posting
//! - Compensations for chargebacks, reorgs and bank returns
//! - Recurring schedules that initiate charges and link the confirmed result
//!
//! # Flow
//!
//! ```text
//! RailAdapter -> ReconciliationEngine -> Ledger -> Projector -> receipts
//!                      |       ^
//!                      v       |
//!                ScheduleEngine (charge initiation, linkage)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod finality;
pub mod metrics;
pub mod pending;
pub mod query;
pub mod review;
pub mod schedule;

pub use config::ReconcilerConfig;
pub use directory::{CharityCategory, CharityDirectory, CharityRecord, InMemoryCharityDirectory};
pub use engine::{Disposition, DonationStatus, DrainReport, MaintenanceReport, ReconciliationEngine};
pub use error::{Error, Result};
pub use finality::{FinalityPolicy, FinalityRule};
pub use review::{ReviewItem, ReviewQueue, ReviewReason};
pub use schedule::{
    Cadence, ChargeAttempt, LinkOutcome, RecurringSchedule, RetryPolicy, ScheduleEngine,
    ScheduleRequest, ScheduleState,
};
