//! Shared types for rail adapters

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ledger_core::{crypto::hash_payload, types::Digest32, DonationEvent, RailKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rail-assigned resumable position
///
/// A cursor names the offset of the next message to deliver; resuming from
/// cursor `n` redelivers every message at offset `>= n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RailCursor(pub u64);

impl RailCursor {
    /// Start of the feed
    pub const START: RailCursor = RailCursor(0);

    /// Cursor just past this one
    pub fn next(self) -> Self {
        RailCursor(self.0 + 1)
    }

    /// Offset value
    pub fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RailCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque message as delivered by a rail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRailMessage {
    /// Rail that delivered the message
    pub rail_kind: RailKind,
    /// Offset of this message in the rail feed
    pub cursor: RailCursor,
    /// Raw bytes (webhook body, indexer record)
    pub payload: Bytes,
    /// When the rail delivered it
    pub received_at: DateTime<Utc>,
}

impl RawRailMessage {
    /// SHA-256 of the raw payload
    pub fn payload_hash(&self) -> Digest32 {
        hash_payload(&self.payload)
    }
}

/// Rail-specific finality signal carried alongside a normalized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RailSignal {
    /// Chain inclusion at the given depth
    Confirmations {
        /// Blocks on top of (and including) the inclusion block
        depth: u32,
    },
    /// Transaction dropped by a chain reorganization
    Reorged,
    /// Fiat authorization (funds held, not settled)
    Authorized,
    /// Fiat settlement callback
    Settled {
        /// Settlement time reported by the processor
        at: DateTime<Utc>,
    },
    /// Chargeback, dispute lost, or bank return
    Chargeback,
    /// Charge declined by the processor
    Declined,
}

impl RailSignal {
    /// Whether the signal reports a reversal regardless of policy
    pub fn is_reversal(&self) -> bool {
        matches!(self, RailSignal::Reorged | RailSignal::Chargeback | RailSignal::Declined)
    }
}

/// Normalized rail fact plus the finality signal it was reported with
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Canonical event (finality still `Pending` until classified)
    pub event: DonationEvent,
    /// Signal for the finality tracker
    pub signal: RailSignal,
}
