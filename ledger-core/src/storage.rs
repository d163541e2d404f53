//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Append-only entry log (key: sequence, big-endian)
//! - `donations` - Per-donation running balance (key: donation_id)
//! - `identities` - Idempotency records (key: rail code || 0x00 || external_id)
//! - `payloads` - Applied rail payload hashes (key: sha256)
//! - `indices` - Secondary indices for charity totals and donation history

use crate::{
    error::{Error, Result},
    types::{
        CharityRef, Currency, Digest32, DonationBalance, DonationIdentity, IdentityKey,
        LedgerEntry, MinorUnits,
    },
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_DONATIONS: &str = "donations";
const CF_IDENTITIES: &str = "identities";
const CF_PAYLOADS: &str = "payloads";
const CF_INDICES: &str = "indices";

/// Index key prefixes
const IDX_CHARITY: u8 = b'c';
const IDX_DONATION: u8 = b'd';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_DONATIONS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_IDENTITIES, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_PAYLOADS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_lookup()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB donation ledger");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Point lookups benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    // Entry operations

    /// Append entry with balance, payload marker and indices (atomic)
    pub fn append_entry_atomic(&self, entry: &LedgerEntry, balance: &DonationBalance) -> Result<()> {
        let mut batch = WriteBatch::default();
        let entry_value = bincode::serialize(entry)?;

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        batch.put_cf(cf_entries, entry.sequence.to_be_bytes(), &entry_value);

        let cf_donations = self.cf_handle(CF_DONATIONS)?;
        batch.put_cf(
            cf_donations,
            balance.donation_id.as_bytes(),
            bincode::serialize(balance)?,
        );

        let cf_payloads = self.cf_handle(CF_PAYLOADS)?;
        batch.put_cf(
            cf_payloads,
            entry.event_ref.raw_payload_hash,
            entry.sequence.to_be_bytes(),
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        // charity || sequence -> entry (denormalized for snapshot totals)
        batch.put_cf(
            cf_indices,
            Self::index_key_charity(&entry.charity_ref, Some(entry.sequence)),
            &entry_value,
        );
        // donation || sequence -> empty
        batch.put_cf(
            cf_indices,
            Self::index_key_donation(&entry.donation_id, Some(entry.sequence)),
            b"",
        );

        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(
            sequence = entry.sequence,
            donation_id = %entry.donation_id,
            net_amount = entry.net_amount,
            "Entry appended"
        );

        Ok(())
    }

    /// Get entry by sequence
    pub fn get_entry(&self, sequence: u64) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        match self.db.get_cf(cf, sequence.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get the entry with the highest sequence
    pub fn last_entry(&self) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Read up to `limit` entries starting at `from_sequence`, in sequence order
    pub fn entries_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let start = from_sequence.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter.take(limit) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// All entries of one donation, in sequence order
    pub fn donation_entries(&self, donation_id: &Uuid) -> Result<Vec<LedgerEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_key_donation(donation_id, None);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence = Self::trailing_sequence(&key)?;
            let entry = self
                .get_entry(sequence)?
                .ok_or_else(|| Error::Storage(format!("Index points at missing entry {}", sequence)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // Donation balance operations

    /// Get running balance of a donation
    pub fn get_balance(&self, donation_id: &Uuid) -> Result<Option<DonationBalance>> {
        let cf = self.cf_handle(CF_DONATIONS)?;
        match self.db.get_cf(cf, donation_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether a rail payload was already applied
    pub fn payload_applied(&self, hash: &Digest32) -> Result<bool> {
        Ok(self.payload_sequence(hash)?.is_some())
    }

    /// Sequence of the latest entry a rail payload was applied to
    pub fn payload_sequence(&self, hash: &Digest32) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_PAYLOADS)?;
        match self.db.get_pinned_cf(cf, hash)? {
            Some(value) => Ok(Some(Self::trailing_sequence(&value)?)),
            None => Ok(None),
        }
    }

    // Identity operations

    /// Get identity record
    pub fn get_identity(&self, key: &IdentityKey) -> Result<Option<DonationIdentity>> {
        let cf = self.cf_handle(CF_IDENTITIES)?;
        match self.db.get_cf(cf, key.storage_key())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put identity record
    pub fn put_identity(&self, identity: &DonationIdentity) -> Result<()> {
        let cf = self.cf_handle(CF_IDENTITIES)?;
        let key = IdentityKey::new(identity.rail_kind, identity.external_id.clone());
        self.db.put_cf_opt(
            cf,
            key.storage_key(),
            bincode::serialize(identity)?,
            &self.write_options(),
        )?;
        Ok(())
    }

    // Reads

    /// Per-currency totals for a charity as of a point in time
    ///
    /// Reads through a RocksDB snapshot, so concurrent appends are either
    /// fully visible or not visible at all.
    pub fn charity_totals(
        &self,
        charity_ref: &CharityRef,
        as_of: DateTime<Utc>,
    ) -> Result<BTreeMap<Currency, MinorUnits>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_key_charity(charity_ref, None);
        let snapshot = self.db.snapshot();
        let iter = snapshot.iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));

        let mut totals = BTreeMap::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entry: LedgerEntry = bincode::deserialize(&value)?;
            if entry.recorded_at <= as_of {
                *totals.entry(entry.currency).or_insert(0) += entry.net_amount;
            }
        }
        Ok(totals)
    }

    // Index key helpers

    fn index_key_charity(charity_ref: &CharityRef, sequence: Option<u64>) -> Vec<u8> {
        // Length-prefixed so no reference is a key prefix of another
        let charity = charity_ref.as_str().as_bytes();
        let mut key = vec![IDX_CHARITY];
        key.extend_from_slice(&(charity.len() as u32).to_be_bytes());
        key.extend_from_slice(charity);
        if let Some(sequence) = sequence {
            key.extend_from_slice(&sequence.to_be_bytes());
        }
        key
    }

    fn index_key_donation(donation_id: &Uuid, sequence: Option<u64>) -> Vec<u8> {
        let mut key = vec![IDX_DONATION];
        key.extend_from_slice(donation_id.as_bytes());
        if let Some(sequence) = sequence {
            key.extend_from_slice(&sequence.to_be_bytes());
        }
        key
    }

    fn trailing_sequence(key: &[u8]) -> Result<u64> {
        if key.len() < 8 {
            return Err(Error::Storage("Index key too short".to_string()));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&key[key.len() - 8..]);
        Ok(u64::from_be_bytes(bytes))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let total_entries = self.last_entry()?.map(|e| e.sequence + 1).unwrap_or(0);
        let total_donations = self.approximate_count(self.cf_handle(CF_DONATIONS)?)?;
        let total_identities = self.approximate_count(self.cf_handle(CF_IDENTITIES)?)?;

        Ok(StorageStats {
            total_entries,
            total_donations,
            total_identities,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Entries in the log (exact)
    pub total_entries: u64,
    /// Donations with a balance (estimate)
    pub total_donations: u64,
    /// Reserved identities (estimate)
    pub total_identities: u64,
}
