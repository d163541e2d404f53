//! Impact & Receipt Projector
//!
//! Read-optimized views derived from the donation ledger:
//! - Charity and donor totals per currency
//! - Tax receipts, reissued with `supersedes` when a compensation lands
//! - Marketplace statistics
//!
//! Every view is a pure fold over ledger entries in sequence order, so the
//! projector can be dropped and rebuilt from `sequence` 0 at any time.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod error;
pub mod notify;
pub mod projection;
pub mod projector;
pub mod receipt;
pub mod stats;

pub use error::{Error, Result};
pub use notify::{ChannelSink, MemorySink, NotificationSink, NullSink};
pub use projection::{project, DonationView, Projection};
pub use projector::Projector;
pub use receipt::{Receipt, ReceiptNotice};
pub use stats::MarketplaceStats;
