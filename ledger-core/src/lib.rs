//! Donation Ledger Core
//!
//! Append-only donation ledger with a hash-chained audit trail and
//! rail-scoped idempotency.
//!
//! # Architecture
//!
//! - **Append-Only**: Entries are never modified; reversals are compensating entries
//! - **Single Writer**: One logical writer task is the only sequencer
//! - **Idempotency**: `(rail_kind, external_id)` reserves a donation id exactly once
//! - **Hash Chain**: Every entry commits to its predecessor
//!
//! # Invariants
//!
//! - A donation's net is the sum of its entries and is either its amount or zero
//! - Duplicate deliveries never produce a second positive entry
//! - Deterministic replay: Same entries → same projections
//! - Linearizable: Total ordering of all entries

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod identity;
pub mod ledger;
pub mod crypto;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    AppendOutcome, CharityRef, Currency, DonationBalance, DonationEvent, DonorRef,
    DuplicateReason, EntryKind, EventRef, FinalityState, IdentityKey, LedgerEntry, MinorUnits,
    Posting, RailKind, Reservation,
};
pub use identity::IdentityStore;
pub use ledger::Ledger;
pub use storage::Storage;
pub use config::Config;
