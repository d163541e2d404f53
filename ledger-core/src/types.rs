//! Core types for the donation ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (signed minor units, `Decimal` only for display)

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amount in the currency's minor unit (cents, satoshi, gwei, ...)
pub type MinorUnits = i64;

/// SHA-256 digest
pub type Digest32 = [u8; 32];

/// Donor reference (opaque identity owned by the donor platform)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DonorRef(String);

impl DonorRef {
    /// Create new donor reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DonorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Charity reference (key into the Charity Directory Service)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CharityRef(String);

impl CharityRef {
    /// Create new charity reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currencies accepted by the platform (fiat and on-chain assets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Bitcoin (minor unit: satoshi)
    BTC,
    /// Ether (minor unit: gwei)
    ETH,
    /// USD Coin
    USDC,
    /// Tether
    USDT,
}

impl Currency {
    /// Currency code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::BTC => "BTC",
            Currency::ETH => "ETH",
            Currency::USDC => "USDC",
            Currency::USDT => "USDT",
        }
    }

    /// Parse from code (case-insensitive)
    pub fn from_code(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "BTC" => Some(Currency::BTC),
            "ETH" => Some(Currency::ETH),
            "USDC" => Some(Currency::USDC),
            "USDT" => Some(Currency::USDT),
            _ => None,
        }
    }

    /// Number of decimal places between the major and the minor unit
    pub fn exponent(&self) -> u32 {
        match self {
            Currency::USD | Currency::EUR | Currency::GBP => 2,
            Currency::BTC => 8,
            Currency::ETH => 9,
            Currency::USDC | Currency::USDT => 6,
        }
    }

    /// Whether this is an on-chain asset
    pub fn is_crypto(&self) -> bool {
        !matches!(self, Currency::USD | Currency::EUR | Currency::GBP)
    }

    /// Convert minor units to an exact major-unit decimal
    pub fn to_major(&self, minor: MinorUnits) -> Decimal {
        Decimal::new(minor, self.exponent())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Payment rail a donation moved through
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RailKind {
    /// Card processor
    FiatCard = 1,
    /// Bank transfer (ACH, SEPA, ...)
    FiatBank = 2,
    /// Bitcoin network
    Btc = 3,
    /// Ethereum network (native ETH)
    Eth = 4,
    /// Stablecoin transfers (ERC-20)
    Stablecoin = 5,
}

impl RailKind {
    /// All rail kinds
    pub const ALL: [RailKind; 5] = [
        RailKind::FiatCard,
        RailKind::FiatBank,
        RailKind::Btc,
        RailKind::Eth,
        RailKind::Stablecoin,
    ];

    /// Stable code used in storage keys and logs
    pub fn code(&self) -> &'static str {
        match self {
            RailKind::FiatCard => "fiat_card",
            RailKind::FiatBank => "fiat_bank",
            RailKind::Btc => "btc",
            RailKind::Eth => "eth",
            RailKind::Stablecoin => "stablecoin",
        }
    }

    /// Parse from code
    pub fn from_code(s: &str) -> Option<Self> {
        RailKind::ALL.into_iter().find(|rail| rail.code() == s)
    }

    /// Whether finality on this rail is driven by block confirmations
    pub fn is_chain(&self) -> bool {
        matches!(self, RailKind::Btc | RailKind::Eth | RailKind::Stablecoin)
    }
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Finality of a rail fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalityState {
    /// Not yet irreversible
    Pending,
    /// Irreversible per rail policy
    Confirmed,
    /// Reversed by the rail (chargeback, reorg, decline)
    Reverted,
}

/// Idempotency key of a rail fact: `(rail_kind, external_id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Rail the external id is scoped to
    pub rail_kind: RailKind,
    /// Rail-scoped unique id
    pub external_id: String,
}

impl IdentityKey {
    /// Create new key
    pub fn new(rail_kind: RailKind, external_id: impl Into<String>) -> Self {
        Self {
            rail_kind,
            external_id: external_id.into(),
        }
    }

    /// Storage key: rail code || 0x00 || external id
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = self.rail_kind.code().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(self.external_id.as_bytes());
        key
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rail_kind, self.external_id)
    }
}

/// Canonical, immutable fact produced by a rail adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationEvent {
    /// Rail-scoped unique id
    pub external_id: String,

    /// Rail the event came from
    pub rail_kind: RailKind,

    /// Amount in minor units (always positive)
    pub amount: MinorUnits,

    /// Currency
    pub currency: Currency,

    /// Donor
    pub donor_ref: DonorRef,

    /// Beneficiary charity
    pub charity_ref: CharityRef,

    /// When the rail reported the fact
    pub observed_at: DateTime<Utc>,

    /// Finality as classified so far
    pub finality_state: FinalityState,

    /// SHA-256 of the raw rail payload
    pub raw_payload_hash: Digest32,

    /// Recurring schedule this charge was made for
    #[serde(default)]
    pub schedule_id: Option<Uuid>,

    /// Donor note attached to the gift
    #[serde(default)]
    pub message: Option<String>,
}

impl DonationEvent {
    /// Idempotency key for this event
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.rail_kind, self.external_id.clone())
    }

    /// Reference stored on ledger entries
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            rail_kind: self.rail_kind,
            external_id: self.external_id.clone(),
            raw_payload_hash: self.raw_payload_hash,
        }
    }

    /// Copy with the given finality
    pub fn with_finality(mut self, finality_state: FinalityState) -> Self {
        self.finality_state = finality_state;
        self
    }
}

/// Reference from a ledger entry back to the rail fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    /// Rail
    pub rail_kind: RailKind,
    /// Rail-scoped id
    pub external_id: String,
    /// Payload hash of the fact that caused the entry
    pub raw_payload_hash: Digest32,
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// First confirmation of a donation
    Donation = 1,
    /// Confirmation after a prior compensation (e.g. reorg re-inclusion)
    Reconfirmation = 2,
    /// Reversal of the donation's current net
    Compensation = 3,
}

/// Append-only ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger-assigned, strictly increasing, starts at 0
    pub sequence: u64,

    /// Stable donation identity (survives compensation chains)
    pub donation_id: Uuid,

    /// Entry kind
    pub kind: EntryKind,

    /// Signed amount in minor units
    pub net_amount: MinorUnits,

    /// Currency
    pub currency: Currency,

    /// Donor
    pub donor_ref: DonorRef,

    /// Beneficiary charity
    pub charity_ref: CharityRef,

    /// Recurring schedule the donation is attributed to
    pub schedule_id: Option<Uuid>,

    /// Donor's message to the charity
    pub message: Option<String>,

    /// Rail fact that caused the entry
    pub event_ref: EventRef,

    /// Ledger timestamp
    pub recorded_at: DateTime<Utc>,

    /// Hash of the previous entry (zeroes for sequence 0)
    pub prev_hash: Digest32,

    /// Hash of this entry chained onto `prev_hash`
    pub entry_hash: Digest32,
}

impl LedgerEntry {
    /// Whether this entry reverses an earlier confirmation
    pub fn is_compensation(&self) -> bool {
        self.kind == EntryKind::Compensation
    }

    /// Calendar year (UTC) the entry was recorded in
    pub fn year(&self) -> i32 {
        self.recorded_at.year()
    }
}

/// Persistent mapping `(rail_kind, external_id) -> donation_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationIdentity {
    /// Rail
    pub rail_kind: RailKind,
    /// Rail-scoped id
    pub external_id: String,
    /// Donation id assigned at reservation
    pub donation_id: Uuid,
    /// Reservation time
    pub reserved_at: DateTime<Utc>,
}

/// Result of an identity reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// First sighting; caller owns the posting
    Fresh(Uuid),
    /// Already reserved; caller must not post a second credit
    AlreadyExists(Uuid),
}

impl Reservation {
    /// Donation id regardless of freshness
    pub fn donation_id(&self) -> Uuid {
        match self {
            Reservation::Fresh(id) | Reservation::AlreadyExists(id) => *id,
        }
    }

    /// Whether this caller won the reservation
    pub fn is_fresh(&self) -> bool {
        matches!(self, Reservation::Fresh(_))
    }
}

/// Request to append to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Posting {
    /// Positive entry for a confirmed donation
    Credit {
        /// Donation id from the identity store
        donation_id: Uuid,
        /// Amount in minor units (must be positive)
        amount: MinorUnits,
        /// Currency
        currency: Currency,
        /// Donor
        donor_ref: DonorRef,
        /// Charity
        charity_ref: CharityRef,
        /// Schedule attribution
        schedule_id: Option<Uuid>,
        /// Donor message
        message: Option<String>,
        /// Rail fact
        event_ref: EventRef,
    },
    /// Negation of the donation's current net
    Compensation {
        /// Donation being reversed
        donation_id: Uuid,
        /// Rail fact reporting the reversal
        event_ref: EventRef,
    },
}

impl Posting {
    /// Credit posting for a confirmed event
    pub fn credit(donation_id: Uuid, event: &DonationEvent) -> Self {
        Posting::Credit {
            donation_id,
            amount: event.amount,
            currency: event.currency,
            donor_ref: event.donor_ref.clone(),
            charity_ref: event.charity_ref.clone(),
            schedule_id: event.schedule_id,
            message: event.message.clone(),
            event_ref: event.event_ref(),
        }
    }

    /// Compensation posting for a reverted event
    pub fn compensation(donation_id: Uuid, event: &DonationEvent) -> Self {
        Posting::Compensation {
            donation_id,
            event_ref: event.event_ref(),
        }
    }

    /// Target donation
    pub fn donation_id(&self) -> Uuid {
        match self {
            Posting::Credit { donation_id, .. } | Posting::Compensation { donation_id, .. } => {
                *donation_id
            }
        }
    }

    /// Rail fact
    pub fn event_ref(&self) -> &EventRef {
        match self {
            Posting::Credit { event_ref, .. } | Posting::Compensation { event_ref, .. } => {
                event_ref
            }
        }
    }
}

/// Why an append was absorbed without writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// The exact rail payload was already applied
    PayloadAlreadyApplied,
    /// The donation already has a positive net
    AlreadyConfirmed,
    /// The donation is already netted to zero
    AlreadyCompensated,
}

/// Result of a ledger append
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Entry written
    Appended(LedgerEntry),
    /// Nothing written; the ledger already reflects this fact
    Duplicate {
        /// Donation
        donation_id: Uuid,
        /// Reason
        reason: DuplicateReason,
    },
}

impl AppendOutcome {
    /// Written entry, if any
    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            AppendOutcome::Appended(entry) => Some(entry),
            AppendOutcome::Duplicate { .. } => None,
        }
    }
}

/// Per-donation running state (derived on append)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationBalance {
    /// Donation
    pub donation_id: Uuid,
    /// Sum of all entries
    pub net_amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// Donor
    pub donor_ref: DonorRef,
    /// Charity
    pub charity_ref: CharityRef,
    /// Schedule attribution
    pub schedule_id: Option<Uuid>,
    /// Donor message from the latest credit
    pub message: Option<String>,
    /// Number of positive entries
    pub confirmations: u32,
    /// Number of compensations
    pub compensations: u32,
    /// First confirmation time
    pub first_confirmed_at: DateTime<Utc>,
    /// Sequence of the latest entry
    pub last_sequence: u64,
}

impl DonationBalance {
    /// Whether the donation currently counts towards totals
    pub fn is_confirmed(&self) -> bool {
        self.net_amount > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_from_code() {
        assert_eq!(Currency::from_code("USD"), Some(Currency::USD));
        assert_eq!(Currency::from_code("usdc"), Some(Currency::USDC));
        assert_eq!(Currency::from_code("DOGE"), None);
    }

    #[test]
    fn test_currency_to_major() {
        assert_eq!(Currency::USD.to_major(5000).to_string(), "50.00");
        assert_eq!(Currency::BTC.to_major(150_000_000).to_string(), "1.50000000");
        assert!(Currency::ETH.is_crypto());
        assert!(!Currency::GBP.is_crypto());
    }

    #[test]
    fn test_rail_kind_codes() {
        for rail in RailKind::ALL {
            assert_eq!(RailKind::from_code(rail.code()), Some(rail));
        }
        assert_eq!(RailKind::from_code("swift"), None);
        assert!(RailKind::Btc.is_chain());
        assert!(!RailKind::FiatCard.is_chain());
    }

    #[test]
    fn test_identity_key_storage_key_is_rail_scoped() {
        let card = IdentityKey::new(RailKind::FiatCard, "tx-1");
        let btc = IdentityKey::new(RailKind::Btc, "tx-1");
        assert_ne!(card.storage_key(), btc.storage_key());
        assert_eq!(card.to_string(), "fiat_card:tx-1");
    }

    #[test]
    fn test_reservation_accessors() {
        let id = Uuid::now_v7();
        assert!(Reservation::Fresh(id).is_fresh());
        assert!(!Reservation::AlreadyExists(id).is_fresh());
        assert_eq!(Reservation::AlreadyExists(id).donation_id(), id);
    }
}
