//! Read-side queries for donors, charities and operators

use crate::{
    engine::{DonationStatus, ReconciliationEngine},
    schedule::RecurringSchedule,
    Result,
};
use chrono::{DateTime, Utc};
use impact_projector::{projection::Totals, MarketplaceStats, Receipt};
use ledger_core::{CharityRef, DonorRef, IdentityKey, RailKind};
use uuid::Uuid;

impl ReconciliationEngine {
    /// Per-currency total credited to a charity as of `as_of`
    ///
    /// Read from the ledger, so it reflects every posted entry even if the
    /// projector lags.
    pub fn charity_totals(&self, charity_ref: &CharityRef, as_of: DateTime<Utc>) -> Result<Totals> {
        Ok(self.ledger().read_total(charity_ref, as_of)?)
    }

    /// Receipts issued to a donor for a tax year
    pub fn donor_receipts(&self, donor_ref: &DonorRef, tax_year: i32) -> Vec<Receipt> {
        self.projector()
            .read(|projection| projection.donor_receipts(donor_ref, tax_year))
    }

    /// Recurring schedule state
    pub fn schedule_status(&self, schedule_id: Uuid) -> Result<RecurringSchedule> {
        self.schedules().status(schedule_id)
    }

    /// Marketplace statistics from the projection
    pub fn marketplace_stats(&self) -> MarketplaceStats {
        self.projector().read(|projection| projection.stats())
    }

    /// Status of a rail fact as donors and charities see it
    ///
    /// The ledger wins over the pending queue: a fact can still be held
    /// briefly after another worker posted it.
    pub fn donation_status(&self, rail_kind: RailKind, external_id: &str) -> Result<DonationStatus> {
        let key = IdentityKey::new(rail_kind, external_id);
        let held = self.pending().contains(&key);

        if let Some(donation_id) = self.ledger().identities().lookup(rail_kind, external_id)? {
            if let Some(balance) = self.ledger().balance(&donation_id)? {
                return Ok(if balance.is_confirmed() {
                    DonationStatus::Confirmed
                } else if held {
                    // Reversed, now awaiting re-inclusion
                    DonationStatus::Pending
                } else {
                    DonationStatus::Reverted
                });
            }
        }

        if held {
            return Ok(DonationStatus::Pending);
        }
        Ok(self.outcome(&key).unwrap_or(DonationStatus::Unknown))
    }
}
