//! Hashing for the audit trail
//!
//! This module provides:
//! - SHA-256 hashing of raw rail payloads
//! - The entry hash chain (`H(prev_hash || canonical(entry))`)
//! - Deterministic UUIDs derived from hashed parts

use crate::types::{Digest32, LedgerEntry};
use crate::Result;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hash raw payload bytes
pub fn hash_payload(payload: &[u8]) -> Digest32 {
    Sha256::digest(payload).into()
}

/// Canonical bytes of an entry (everything except the hash fields)
pub fn canonical_entry_bytes(entry: &LedgerEntry) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(&(
        entry.sequence,
        entry.donation_id,
        entry.kind as u8,
        entry.net_amount,
        entry.currency,
        &entry.donor_ref,
        &entry.charity_ref,
        entry.schedule_id,
        &entry.message,
        &entry.event_ref,
        entry.recorded_at.timestamp_micros(),
    ))?;
    Ok(bytes)
}

/// Compute the chained hash of an entry
pub fn chain_hash(prev_hash: &Digest32, entry: &LedgerEntry) -> Result<Digest32> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(canonical_entry_bytes(entry)?);
    Ok(hasher.finalize().into())
}

/// Check that `entry` is correctly chained onto `prev_hash`
pub fn verify_link(prev_hash: &Digest32, entry: &LedgerEntry) -> Result<bool> {
    if &entry.prev_hash != prev_hash {
        return Ok(false);
    }
    Ok(chain_hash(prev_hash, entry)? == entry.entry_hash)
}

/// Deterministic UUID from hashed parts
///
/// Same parts always produce the same id, which keeps replayed projections
/// byte-identical.
pub fn derive_uuid(parts: &[&[u8]]) -> Uuid {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let digest: Digest32 = hasher.finalize().into();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_custom_bytes(bytes).into_uuid()
}

/// Hex encoding for log output
pub fn to_hex(digest: &Digest32) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CharityRef, Currency, DonorRef, EntryKind, EventRef, RailKind};
    use chrono::Utc;

    fn entry(sequence: u64, prev_hash: Digest32) -> LedgerEntry {
        let mut entry = LedgerEntry {
            sequence,
            donation_id: Uuid::now_v7(),
            kind: EntryKind::Donation,
            net_amount: 5000,
            currency: Currency::USD,
            donor_ref: DonorRef::new("donor-1"),
            charity_ref: CharityRef::new("charity-1"),
            schedule_id: None,
            message: None,
            event_ref: EventRef {
                rail_kind: RailKind::FiatCard,
                external_id: format!("ch_{}", sequence),
                raw_payload_hash: hash_payload(b"{}"),
            },
            recorded_at: Utc::now(),
            prev_hash,
            entry_hash: [0u8; 32],
        };
        entry.entry_hash = chain_hash(&prev_hash, &entry).unwrap();
        entry
    }

    #[test]
    fn test_hash_payload_deterministic() {
        assert_eq!(hash_payload(b"abc"), hash_payload(b"abc"));
        assert_ne!(hash_payload(b"abc"), hash_payload(b"abd"));
    }

    #[test]
    fn test_chain_links_verify() {
        let first = entry(0, [0u8; 32]);
        let second = entry(1, first.entry_hash);
        assert!(verify_link(&[0u8; 32], &first).unwrap());
        assert!(verify_link(&first.entry_hash, &second).unwrap());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let mut first = entry(0, [0u8; 32]);
        first.net_amount = 1;
        assert!(!verify_link(&[0u8; 32], &first).unwrap());
    }

    #[test]
    fn test_derive_uuid_deterministic() {
        let a = derive_uuid(&[b"donation", b"2025"]);
        let b = derive_uuid(&[b"donation", b"2025"]);
        let c = derive_uuid(&[b"donation2", b"025"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
