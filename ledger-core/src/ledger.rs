//! Main ledger orchestration layer
//!
//! This module ties together storage, identity, crypto, and actor components
//! into a high-level API for donation accounting.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(config).await?;
//!
//!     // Reserve, then post
//!     // let reservation = ledger.identities().reserve(event.rail_kind, &event.external_id)?;
//!     // ledger.append(Posting::credit(reservation.donation_id(), &event)).await?;
//!
//!     ledger.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    crypto::verify_link,
    identity::IdentityStore,
    metrics::Metrics,
    storage::StorageStats,
    types::{AppendOutcome, CharityRef, Currency, DonationBalance, LedgerEntry, MinorUnits, Posting},
    Config, Error, Result, Storage,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Main ledger interface
pub struct Ledger {
    /// Actor handle for appends
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Idempotency store
    identities: IdentityStore,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("storage", &self.storage)
            .field("service_name", &self.config.service_name)
            .finish()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()?;

        let handle = spawn_ledger_actor(storage.clone(), config.mailbox_capacity, metrics.clone())?;

        Ok(Self {
            handle,
            identities: IdentityStore::new(storage.clone()),
            storage,
            metrics,
            config,
        })
    }

    /// Idempotency store
    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    /// Append a posting
    ///
    /// Sequencing, duplicate absorption and compensation ordering are decided
    /// by the single writer, so concurrent callers never race each other.
    pub async fn append(&self, posting: Posting) -> Result<AppendOutcome> {
        self.handle.append(posting).await
    }

    /// Per-currency total credited to a charity as of a point in time
    ///
    /// Includes every entry with `recorded_at <= as_of`. Charities without
    /// entries yield an empty map.
    pub fn read_total(
        &self,
        charity_ref: &CharityRef,
        as_of: DateTime<Utc>,
    ) -> Result<BTreeMap<Currency, MinorUnits>> {
        self.storage.charity_totals(charity_ref, as_of)
    }

    /// Running balance of a donation
    pub fn balance(&self, donation_id: &Uuid) -> Result<Option<DonationBalance>> {
        self.storage.get_balance(donation_id)
    }

    /// Full entry history of a donation
    pub fn donation_entries(&self, donation_id: &Uuid) -> Result<Vec<LedgerEntry>> {
        let entries = self.storage.donation_entries(donation_id)?;
        if entries.is_empty() {
            return Err(Error::DonationNotFound(donation_id.to_string()));
        }
        Ok(entries)
    }

    /// Entry by sequence
    pub fn entry(&self, sequence: u64) -> Result<Option<LedgerEntry>> {
        self.storage.get_entry(sequence)
    }

    /// One page of entries starting at `from_sequence`
    pub fn entries_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_from(from_sequence, limit)
    }

    /// Stream every entry from `from_sequence` in sequence order
    ///
    /// The visitor's error type only needs to absorb ledger errors, so
    /// downstream folds can abort the replay with their own errors.
    pub fn replay<F, E>(&self, from_sequence: u64, mut visit: F) -> std::result::Result<u64, E>
    where
        F: FnMut(&LedgerEntry) -> std::result::Result<(), E>,
        E: From<Error>,
    {
        let page_size = self.config.replay_page_size.max(1);
        let mut next = from_sequence;
        let mut visited = 0u64;

        loop {
            let page = self.storage.entries_from(next, page_size)?;
            let Some(last) = page.last() else { break };
            next = last.sequence + 1;

            for entry in &page {
                visit(entry)?;
                visited += 1;
            }

            if page.len() < page_size {
                break;
            }
        }

        Ok(visited)
    }

    /// Collect every entry (small ledgers and tests)
    pub fn replay_all(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        self.replay::<_, Error>(0, |entry| {
            entries.push(entry.clone());
            Ok(())
        })?;
        Ok(entries)
    }

    /// Verify sequence contiguity and the hash chain over the whole log
    ///
    /// Returns the number of verified entries.
    pub fn verify_chain(&self) -> Result<u64> {
        let mut prev_hash = [0u8; 32];
        let mut expected_sequence = 0u64;

        let verified = self.replay(0, |entry| {
            if entry.sequence != expected_sequence {
                return Err(Error::ChainBroken {
                    sequence: expected_sequence,
                    reason: format!("found sequence {} instead", entry.sequence),
                });
            }
            if !verify_link(&prev_hash, entry)? {
                return Err(Error::ChainBroken {
                    sequence: entry.sequence,
                    reason: "entry hash does not match its contents".to_string(),
                });
            }
            prev_hash = entry.entry_hash;
            expected_sequence += 1;
            Ok(())
        })?;

        tracing::info!(verified, "Audit chain verified");
        Ok(verified)
    }

    /// Highest assigned sequence
    pub fn head(&self) -> Result<Option<u64>> {
        Ok(self.storage.last_entry()?.map(|entry| entry.sequence))
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the writer
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_payload;
    use crate::types::{
        DonationEvent, DonorRef, DuplicateReason, EntryKind, FinalityState, RailKind, Reservation,
    };
    use tempfile::TempDir;

    async fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    fn event(external_id: &str, charity: &str, amount: i64, payload: &str) -> DonationEvent {
        DonationEvent {
            external_id: external_id.to_string(),
            rail_kind: RailKind::FiatCard,
            amount,
            currency: Currency::USD,
            donor_ref: DonorRef::new("donor-1"),
            charity_ref: CharityRef::new(charity),
            observed_at: Utc::now(),
            finality_state: FinalityState::Confirmed,
            raw_payload_hash: hash_payload(payload.as_bytes()),
            schedule_id: None,
            message: None,
        }
    }

    async fn confirm(ledger: &Ledger, event: &DonationEvent) -> (Reservation, AppendOutcome) {
        let reservation = ledger
            .identities()
            .reserve(event.rail_kind, &event.external_id)
            .unwrap();
        let outcome = ledger
            .append(Posting::credit(reservation.donation_id(), event))
            .await
            .unwrap();
        (reservation, outcome)
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (ledger, _temp) = create_test_ledger().await;
        assert_eq!(ledger.head().unwrap(), None);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmed_fiat_donation_counts_once() {
        let (ledger, _temp) = create_test_ledger().await;
        let charity = CharityRef::new("charity-1");
        let donation = event("ch_1", "charity-1", 5000, "payload-1");

        let (reservation, outcome) = confirm(&ledger, &donation).await;
        assert!(reservation.is_fresh());
        let entry = outcome.entry().unwrap();
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.kind, EntryKind::Donation);

        // Redelivery of the same payload
        let (reservation, outcome) = confirm(&ledger, &donation).await;
        assert!(!reservation.is_fresh());
        assert_eq!(
            outcome,
            AppendOutcome::Duplicate {
                donation_id: reservation.donation_id(),
                reason: DuplicateReason::PayloadAlreadyApplied,
            }
        );

        let totals = ledger.read_total(&charity, Utc::now()).unwrap();
        assert_eq!(totals.get(&Currency::USD), Some(&5000));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_credit_with_new_payload_is_absorbed() {
        let (ledger, _temp) = create_test_ledger().await;
        let first = event("0xabc", "charity-1", 100, "block-1");
        let (reservation, _) = confirm(&ledger, &first).await;

        let other_payload = event("0xabc", "charity-1", 100, "block-1-again");
        let outcome = ledger
            .append(Posting::credit(reservation.donation_id(), &other_payload))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Duplicate {
                reason: DuplicateReason::AlreadyConfirmed,
                ..
            }
        ));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_compensation_nets_to_zero() {
        let (ledger, _temp) = create_test_ledger().await;
        let charity = CharityRef::new("charity-1");
        let donation = event("ch_2", "charity-1", 5000, "confirm");
        let (reservation, _) = confirm(&ledger, &donation).await;

        let chargeback = event("ch_2", "charity-1", 5000, "chargeback");
        let outcome = ledger
            .append(Posting::compensation(reservation.donation_id(), &chargeback))
            .await
            .unwrap();
        let entry = outcome.entry().unwrap();
        assert_eq!(entry.kind, EntryKind::Compensation);
        assert_eq!(entry.net_amount, -5000);

        let totals = ledger.read_total(&charity, Utc::now()).unwrap();
        assert_eq!(totals.get(&Currency::USD), Some(&0));

        // A second reversal report changes nothing
        let again = event("ch_2", "charity-1", 5000, "chargeback-resent");
        let outcome = ledger
            .append(Posting::compensation(reservation.donation_id(), &again))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::Duplicate {
                reason: DuplicateReason::AlreadyCompensated,
                ..
            }
        ));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_compensation_without_confirmation_is_rejected() {
        let (ledger, _temp) = create_test_ledger().await;
        let reversal = event("ch_3", "charity-1", 5000, "chargeback");

        let result = ledger
            .append(Posting::compensation(Uuid::now_v7(), &reversal))
            .await;
        assert!(matches!(result, Err(Error::OutOfOrderCompensation(_))));
        assert_eq!(ledger.head().unwrap(), None);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfirmation_after_reorg() {
        let (ledger, _temp) = create_test_ledger().await;
        let tx = event("txid", "charity-1", 150_000, "block-a");
        let (reservation, _) = confirm(&ledger, &tx).await;
        let donation_id = reservation.donation_id();

        ledger
            .append(Posting::compensation(donation_id, &event("txid", "charity-1", 150_000, "reorg")))
            .await
            .unwrap();
        let outcome = ledger
            .append(Posting::credit(donation_id, &event("txid", "charity-1", 150_000, "block-b")))
            .await
            .unwrap();
        assert_eq!(outcome.entry().unwrap().kind, EntryKind::Reconfirmation);

        let history = ledger.donation_entries(&donation_id).unwrap();
        let net: i64 = history.iter().map(|e| e.net_amount).sum();
        assert_eq!(history.len(), 3);
        assert_eq!(net, 150_000);

        let balance = ledger.balance(&donation_id).unwrap().unwrap();
        assert_eq!(balance.confirmations, 2);
        assert_eq!(balance.compensations, 1);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_total_as_of_excludes_later_entries() {
        let (ledger, _temp) = create_test_ledger().await;
        let charity = CharityRef::new("charity-1");

        let (_, first) = confirm(&ledger, &event("a", "charity-1", 1000, "a")).await;
        let cutoff = first.entry().unwrap().recorded_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        confirm(&ledger, &event("b", "charity-1", 2000, "b")).await;

        let at_cutoff = ledger.read_total(&charity, cutoff).unwrap();
        assert_eq!(at_cutoff.get(&Currency::USD), Some(&1000));

        let now = ledger.read_total(&charity, Utc::now()).unwrap();
        assert_eq!(now.get(&Currency::USD), Some(&3000));

        assert!(ledger
            .read_total(&CharityRef::new("unknown"), Utc::now())
            .unwrap()
            .is_empty());

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_pages_and_verify_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        config.replay_page_size = 3;
        let ledger = Ledger::open(config).await.unwrap();

        for i in 0..7 {
            let id = format!("ch_{}", i);
            confirm(&ledger, &event(&id, "charity-1", 100, &id)).await;
        }

        let sequences: Vec<u64> = ledger.replay_all().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..7).collect::<Vec<_>>());
        assert_eq!(ledger.verify_chain().unwrap(), 7);

        let mut tail = Vec::new();
        ledger
            .replay(5, |entry| {
                tail.push(entry.sequence);
                Ok::<(), Error>(())
            })
            .unwrap();
        assert_eq!(tail, vec![5, 6]);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_track_duplicates() {
        let (ledger, _temp) = create_test_ledger().await;
        let donation = event("ch_9", "charity-1", 5000, "p");
        confirm(&ledger, &donation).await;
        confirm(&ledger, &donation).await;

        assert_eq!(ledger.metrics().entries_total.get(), 1);
        assert_eq!(ledger.metrics().duplicates_total.get(), 1);

        ledger.shutdown().await.unwrap();
    }
}
