//! Ledger projection
//!
//! `Projection::apply` is the incremental step; `project` folds a full
//! history. Both produce identical state for the same entries because all
//! derived values (receipt ids, issue times, tax years) come from the
//! entries themselves.

use crate::{receipt::Receipt, stats::MarketplaceStats, Error, Result};
use ledger_core::{CharityRef, Currency, DonorRef, EntryKind, LedgerEntry, MinorUnits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-currency amounts
pub type Totals = BTreeMap<Currency, MinorUnits>;

/// Projected state of one donation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationView {
    /// Donation
    pub donation_id: Uuid,
    /// Donor
    pub donor_ref: DonorRef,
    /// Beneficiary
    pub charity_ref: CharityRef,
    /// Currency
    pub currency: Currency,
    /// Current net
    pub net_amount: MinorUnits,
    /// Tax year fixed at first confirmation
    pub tax_year: i32,
    /// Schedule attribution
    pub schedule_id: Option<Uuid>,
    /// Donor's message to the charity
    pub message: Option<String>,
    /// Receipt currently in force
    pub current_receipt: Option<Uuid>,
    /// Entries seen for this donation
    pub entry_count: u32,
}

/// Derived read views
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    charity_totals: BTreeMap<CharityRef, Totals>,
    donor_totals: BTreeMap<DonorRef, Totals>,
    /// Issuance order
    receipts: Vec<Receipt>,
    donations: BTreeMap<Uuid, DonationView>,
    last_sequence: Option<u64>,
}

impl Projection {
    /// Empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence this projection accepts
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.map(|s| s + 1).unwrap_or(0)
    }

    /// Last applied sequence
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Apply one entry; returns the receipt it issued
    ///
    /// Entries at or below the last applied sequence are ignored, so
    /// redelivery is harmless. Skipping ahead is an error.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<Option<Receipt>> {
        let expected = self.next_sequence();
        if entry.sequence < expected {
            return Ok(None);
        }
        if entry.sequence > expected {
            return Err(Error::SequenceGap {
                expected,
                found: entry.sequence,
            });
        }

        *self
            .charity_totals
            .entry(entry.charity_ref.clone())
            .or_default()
            .entry(entry.currency)
            .or_insert(0) += entry.net_amount;
        *self
            .donor_totals
            .entry(entry.donor_ref.clone())
            .or_default()
            .entry(entry.currency)
            .or_insert(0) += entry.net_amount;

        let view = self
            .donations
            .entry(entry.donation_id)
            .or_insert_with(|| DonationView {
                donation_id: entry.donation_id,
                donor_ref: entry.donor_ref.clone(),
                charity_ref: entry.charity_ref.clone(),
                currency: entry.currency,
                net_amount: 0,
                tax_year: entry.year(),
                schedule_id: entry.schedule_id,
                message: None,
                current_receipt: None,
                entry_count: 0,
            });
        view.net_amount += entry.net_amount;
        view.entry_count += 1;
        if entry.message.is_some() {
            view.message = entry.message.clone();
        }

        let supersedes = match entry.kind {
            EntryKind::Donation => None,
            EntryKind::Reconfirmation | EntryKind::Compensation => view.current_receipt,
        };
        let receipt = Receipt {
            receipt_id: Receipt::derive_id(&entry.donation_id, view.tax_year, entry.sequence),
            donation_id: entry.donation_id,
            donor_ref: view.donor_ref.clone(),
            charity_ref: view.charity_ref.clone(),
            tax_year: view.tax_year,
            amount: view.net_amount,
            currency: view.currency,
            issued_at: entry.recorded_at,
            sequence: entry.sequence,
            supersedes,
            message: view.message.clone(),
        };
        view.current_receipt = Some(receipt.receipt_id);

        self.receipts.push(receipt.clone());
        self.last_sequence = Some(entry.sequence);

        Ok(Some(receipt))
    }

    /// Per-currency totals credited to a charity
    pub fn charity_totals(&self, charity_ref: &CharityRef) -> Totals {
        self.charity_totals.get(charity_ref).cloned().unwrap_or_default()
    }

    /// Per-currency totals given by a donor
    pub fn donor_totals(&self, donor_ref: &DonorRef) -> Totals {
        self.donor_totals.get(donor_ref).cloned().unwrap_or_default()
    }

    /// Every charity with at least one entry
    pub fn charities(&self) -> impl Iterator<Item = (&CharityRef, &Totals)> {
        self.charity_totals.iter()
    }

    /// Receipts issued to a donor for a tax year, in issuance order
    pub fn donor_receipts(&self, donor_ref: &DonorRef, tax_year: i32) -> Vec<Receipt> {
        self.receipts
            .iter()
            .filter(|r| &r.donor_ref == donor_ref && r.tax_year == tax_year)
            .cloned()
            .collect()
    }

    /// Receipt history of one donation
    pub fn donation_receipts(&self, donation_id: &Uuid) -> Vec<Receipt> {
        self.receipts
            .iter()
            .filter(|r| &r.donation_id == donation_id)
            .cloned()
            .collect()
    }

    /// Receipt by id
    pub fn receipt(&self, receipt_id: &Uuid) -> Option<&Receipt> {
        self.receipts.iter().find(|r| &r.receipt_id == receipt_id)
    }

    /// All receipts in issuance order
    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    /// Projected donation
    pub fn donation(&self, donation_id: &Uuid) -> Option<&DonationView> {
        self.donations.get(donation_id)
    }

    /// All projected donations
    pub fn donations(&self) -> impl Iterator<Item = &DonationView> {
        self.donations.values()
    }

    /// Marketplace statistics
    pub fn stats(&self) -> MarketplaceStats {
        MarketplaceStats::from_projection(self)
    }
}

/// Fold a full ledger history into a projection
pub fn project<'a, I>(entries: I) -> Result<Projection>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut projection = Projection::new();
    for entry in entries {
        projection.apply(entry)?;
    }
    Ok(projection)
}
