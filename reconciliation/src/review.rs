//! Operational review queue
//!
//! Per-event failures that need a human (malformed payloads, unmapped
//! currencies, out-of-order compensations, expired pending facts, postings
//! to unverified charities) land here instead of being dropped. Donors and
//! charities never see these items; they only see donation status.

use chrono::{DateTime, Utc};
use ledger_core::{DonationEvent, RailKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why an item needs review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewReason {
    /// Rail payload missing required fields
    Malformed,
    /// Currency not mapped for the rail
    UnsupportedCurrency,
    /// Reversal for a donation with no confirmed entry
    OutOfOrderCompensation,
    /// Pending longer than the observation window
    Expired,
    /// Charity exists but is not verified
    UnverifiedCharity,
    /// Charity unknown to the directory
    UnknownCharity,
    /// Rail has no finality rule
    MissingPolicy,
    /// Rail fact disagrees with the donation it maps to
    IdentityConflict,
}

impl ReviewReason {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ReviewReason::Malformed => "malformed",
            ReviewReason::UnsupportedCurrency => "unsupported_currency",
            ReviewReason::OutOfOrderCompensation => "out_of_order_compensation",
            ReviewReason::Expired => "expired",
            ReviewReason::UnverifiedCharity => "unverified_charity",
            ReviewReason::UnknownCharity => "unknown_charity",
            ReviewReason::MissingPolicy => "missing_policy",
            ReviewReason::IdentityConflict => "identity_conflict",
        }
    }
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One item awaiting review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Queue-assigned id
    pub id: u64,
    /// Reason
    pub reason: ReviewReason,
    /// Rail the fact came from
    pub rail_kind: RailKind,
    /// Rail-scoped id, when the payload got far enough to have one
    pub external_id: Option<String>,
    /// Human-readable detail
    pub detail: String,
    /// Normalized event, when available
    pub event: Option<DonationEvent>,
    /// When it was raised
    pub raised_at: DateTime<Utc>,
}

/// In-memory review queue
#[derive(Debug, Default)]
pub struct ReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
    next_id: AtomicU64,
}

impl ReviewQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an item for a rail fact that never normalized
    pub fn raise(&self, reason: ReviewReason, rail_kind: RailKind, detail: impl Into<String>) -> u64 {
        self.push(reason, rail_kind, None, detail.into(), None)
    }

    /// Raise an item for a normalized event
    pub fn raise_event(
        &self,
        reason: ReviewReason,
        event: &DonationEvent,
        detail: impl Into<String>,
    ) -> u64 {
        self.push(
            reason,
            event.rail_kind,
            Some(event.external_id.clone()),
            detail.into(),
            Some(event.clone()),
        )
    }

    fn push(
        &self,
        reason: ReviewReason,
        rail_kind: RailKind,
        external_id: Option<String>,
        detail: String,
        event: Option<DonationEvent>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            review_id = id,
            reason = %reason,
            rail = %rail_kind,
            external_id = external_id.as_deref().unwrap_or("-"),
            detail = %detail,
            "Raised for manual review"
        );
        self.items.lock().push(ReviewItem {
            id,
            reason,
            rail_kind,
            external_id,
            detail,
            event,
            raised_at: Utc::now(),
        });
        id
    }

    /// Open items, oldest first
    pub fn list(&self) -> Vec<ReviewItem> {
        self.items.lock().clone()
    }

    /// Open items with a given reason
    pub fn by_reason(&self, reason: ReviewReason) -> Vec<ReviewItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| item.reason == reason)
            .cloned()
            .collect()
    }

    /// Open items for one rail fact
    pub fn for_event(&self, rail_kind: RailKind, external_id: &str) -> Vec<ReviewItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| {
                item.rail_kind == rail_kind && item.external_id.as_deref() == Some(external_id)
            })
            .cloned()
            .collect()
    }

    /// Close an item
    pub fn resolve(&self, id: u64) -> Option<ReviewItem> {
        let mut items = self.items.lock();
        let index = items.iter().position(|item| item.id == id)?;
        Some(items.remove(index))
    }

    /// Number of open items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing awaits review
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
