//! # Rail Adapters
//!
//! Payment-rail connectivity layer with:
//! - A common `RailAdapter` capability interface
//! - Resumable, cursor-addressed delivery (at-least-once)
//! - Normalization of raw rail payloads into canonical `DonationEvent`s
//! - A charge initiator interface for recurring giving
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Reconciliation Engine (one worker per rail)  │
//! └────────────┬────────────────────────────────────────┘
//!              │ poll_or_receive / normalize / acknowledge
//!     ┌────────┼────────────────┬────────────┐
//!     │        │                │            │
//! ┌───▼────┐ ┌─▼──────┐ ┌──────▼──┐ ┌───────▼──────┐
//! │  Card  │ │  Bank  │ │   BTC   │ │ ETH/ERC-20   │
//! │Adapter │ │Adapter │ │ Adapter │ │   Adapter    │
//! └───┬────┘ └─┬──────┘ └──────┬──┘ └───────┬──────┘
//!     │        │                │            │
//!     └────────┼────────────────┴────────────┘
//!              │
//! ┌────────────▼─────────────────────────────────────┐
//! │     Rail feeds (webhook log / chain indexer)     │
//! └──────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod chain;
pub mod charge;
pub mod error;
pub mod feed;
pub mod fiat;
pub mod rail;
pub mod types;

pub use chain::ChainAdapter;
pub use charge::{ChargeInitiator, ChargeReceipt, ChargeRequest, ScriptedOutcome, SimulatedProcessor};
pub use error::{Error, Result};
pub use feed::RailFeed;
pub use fiat::FiatAdapter;
pub use rail::RailAdapter;
pub use types::*;

/// Default maximum messages returned by one poll
pub const DEFAULT_POLL_BATCH_SIZE: usize = 256;
