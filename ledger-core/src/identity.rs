//! Idempotency & dedup store
//!
//! Maps `(rail_kind, external_id)` to a `donation_id` for the lifetime of the
//! system. `reserve` is an atomic check-and-reserve: under concurrent delivery
//! of the same rail fact exactly one caller receives `Reservation::Fresh`.

use crate::{
    types::{DonationIdentity, IdentityKey, RailKind, Reservation},
    Result, Storage,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Persistent identity store
#[derive(Debug)]
pub struct IdentityStore {
    storage: Arc<Storage>,
    /// Read-through cache of reserved identities
    cache: DashMap<IdentityKey, Uuid>,
    /// Serializes compare-and-set
    reserve_lock: Mutex<()>,
}

impl IdentityStore {
    /// Create store over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
            reserve_lock: Mutex::new(()),
        }
    }

    /// Reserve a donation id for a rail fact
    pub fn reserve(&self, rail_kind: RailKind, external_id: &str) -> Result<Reservation> {
        let key = IdentityKey::new(rail_kind, external_id);

        if let Some(existing) = self.cache.get(&key) {
            return Ok(Reservation::AlreadyExists(*existing));
        }

        let _guard = self.reserve_lock.lock();

        // Re-check under the lock; another caller may have won
        if let Some(existing) = self.lookup_key(&key)? {
            return Ok(Reservation::AlreadyExists(existing));
        }

        let identity = DonationIdentity {
            rail_kind,
            external_id: external_id.to_string(),
            donation_id: Uuid::now_v7(),
            reserved_at: Utc::now(),
        };
        self.storage.put_identity(&identity)?;
        self.cache.insert(key, identity.donation_id);

        tracing::debug!(
            rail = %rail_kind,
            external_id,
            donation_id = %identity.donation_id,
            "Identity reserved"
        );

        Ok(Reservation::Fresh(identity.donation_id))
    }

    /// Look up an existing reservation without creating one
    pub fn lookup(&self, rail_kind: RailKind, external_id: &str) -> Result<Option<Uuid>> {
        self.lookup_key(&IdentityKey::new(rail_kind, external_id))
    }

    fn lookup_key(&self, key: &IdentityKey) -> Result<Option<Uuid>> {
        if let Some(existing) = self.cache.get(key) {
            return Ok(Some(*existing));
        }

        match self.storage.get_identity(key)? {
            Some(identity) => {
                self.cache.insert(key.clone(), identity.donation_id);
                Ok(Some(identity.donation_id))
            }
            None => Ok(None),
        }
    }

    /// Full identity record
    pub fn get(&self, rail_kind: RailKind, external_id: &str) -> Result<Option<DonationIdentity>> {
        self.storage
            .get_identity(&IdentityKey::new(rail_kind, external_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn test_store() -> (Arc<IdentityStore>, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config).unwrap());
        (Arc::new(IdentityStore::new(storage.clone())), storage, temp_dir)
    }

    #[test]
    fn test_reserve_then_already_exists() {
        let (store, _storage, _temp) = test_store();

        let first = store.reserve(RailKind::Btc, "txid-1").unwrap();
        assert!(first.is_fresh());

        let second = store.reserve(RailKind::Btc, "txid-1").unwrap();
        assert_eq!(second, Reservation::AlreadyExists(first.donation_id()));
    }

    #[test]
    fn test_same_external_id_on_other_rail_is_distinct() {
        let (store, _storage, _temp) = test_store();

        let btc = store.reserve(RailKind::Btc, "shared").unwrap();
        let eth = store.reserve(RailKind::Eth, "shared").unwrap();
        assert!(btc.is_fresh());
        assert!(eth.is_fresh());
        assert_ne!(btc.donation_id(), eth.donation_id());
    }

    #[test]
    fn test_reservation_survives_new_store_instance() {
        let (store, storage, _temp) = test_store();
        let first = store.reserve(RailKind::FiatCard, "ch_1").unwrap();

        // Fresh cache, same storage
        let restarted = IdentityStore::new(storage);
        assert_eq!(
            restarted.reserve(RailKind::FiatCard, "ch_1").unwrap(),
            Reservation::AlreadyExists(first.donation_id())
        );
        assert_eq!(
            restarted.lookup(RailKind::FiatCard, "ch_1").unwrap(),
            Some(first.donation_id())
        );
        assert_eq!(restarted.lookup(RailKind::FiatCard, "ch_2").unwrap(), None);
    }

    #[test]
    fn test_concurrent_reserve_has_single_winner() {
        let (store, _storage, _temp) = test_store();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.reserve(RailKind::Eth, "0xabc").unwrap())
            })
            .collect();

        let results: Vec<Reservation> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let fresh = results.iter().filter(|r| r.is_fresh()).count();
        let ids: HashSet<Uuid> = results.iter().map(|r| r.donation_id()).collect();

        assert_eq!(fresh, 1);
        assert_eq!(ids.len(), 1);
    }
}
