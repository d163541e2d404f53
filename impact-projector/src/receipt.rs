//! Tax receipts
//!
//! Receipts are immutable once issued. A compensation (or a reconfirmation
//! after one) issues a fresh receipt whose `supersedes` points at the one it
//! replaces.

use chrono::{DateTime, Utc};
use ledger_core::{crypto::derive_uuid, CharityRef, Currency, DonorRef, MinorUnits};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Derived tax receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Deterministic id (same ledger, same id)
    pub receipt_id: Uuid,
    /// Donation the receipt covers
    pub donation_id: Uuid,
    /// Donor
    pub donor_ref: DonorRef,
    /// Beneficiary
    pub charity_ref: CharityRef,
    /// UTC calendar year of first confirmation
    pub tax_year: i32,
    /// Net donated amount as of issuance
    pub amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// `recorded_at` of the entry that caused issuance
    pub issued_at: DateTime<Utc>,
    /// Ledger sequence that caused issuance
    pub sequence: u64,
    /// Receipt this one replaces
    pub supersedes: Option<Uuid>,
    /// Donor's message to the charity
    pub message: Option<String>,
}

impl Receipt {
    /// Deterministic receipt id
    pub fn derive_id(donation_id: &Uuid, tax_year: i32, sequence: u64) -> Uuid {
        derive_uuid(&[
            b"receipt",
            donation_id.as_bytes(),
            &tax_year.to_be_bytes(),
            &sequence.to_be_bytes(),
        ])
    }

    /// Whether the receipt voids the donation (net zero)
    pub fn is_void(&self) -> bool {
        self.amount == 0
    }

    /// Payload for the Notification Service
    pub fn notice(&self) -> ReceiptNotice {
        ReceiptNotice {
            receipt_id: self.receipt_id,
            donor_ref: self.donor_ref.clone(),
            amount: self.amount,
            currency: self.currency,
            tax_year: self.tax_year,
            supersedes: self.supersedes,
        }
    }

    /// Human-readable receipt
    pub fn render_text(&self, charity_name: &str) -> String {
        ReceiptText {
            receipt: self,
            charity_name,
        }
        .to_string()
    }
}

/// Text rendering of a receipt under a charity's display name
struct ReceiptText<'a> {
    receipt: &'a Receipt,
    charity_name: &'a str,
}

impl fmt::Display for ReceiptText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let receipt = self.receipt;
        let rule = "═".repeat(44);

        writeln!(f, "╔{}╗", rule)?;
        writeln!(f, "║{:^44}║", "DONATION RECEIPT")?;
        writeln!(f, "╚{}╝", rule)?;
        writeln!(f)?;
        writeln!(f, "Receipt ID: {}", receipt.receipt_id)?;
        writeln!(f, "Donation ID: {}", receipt.donation_id)?;
        writeln!(f, "Donor: {}", receipt.donor_ref)?;
        writeln!(f, "Charity: {}", self.charity_name)?;
        writeln!(
            f,
            "Amount: {} {}",
            receipt.currency.to_major(receipt.amount),
            receipt.currency
        )?;
        writeln!(f, "Date: {}", receipt.issued_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Tax Year: {}", receipt.tax_year)?;
        if let Some(previous) = receipt.supersedes {
            writeln!(f, "Supersedes: {}", previous)?;
        }
        if receipt.is_void() {
            writeln!(f, "Status: VOID (donation reversed)")?;
        }
        writeln!(f)?;
        let message = receipt.message.as_deref().filter(|m| !m.is_empty());
        writeln!(f, "Message: {}", message.unwrap_or("N/A"))?;
        writeln!(f)?;
        writeln!(f, "Thank you for your generous donation!")?;
        write!(f, "{}", rule)
    }
}

/// Event emitted to the Notification Service for every issued receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptNotice {
    /// Receipt
    pub receipt_id: Uuid,
    /// Donor to notify
    pub donor_ref: DonorRef,
    /// Amount in minor units
    pub amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// Tax year
    pub tax_year: i32,
    /// Replaced receipt, if any
    pub supersedes: Option<Uuid>,
}
