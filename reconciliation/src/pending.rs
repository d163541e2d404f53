//! Bounded retry queue for unsettled rail facts
//!
//! Keyed by `(rail_kind, external_id)`. A newer observation of the same fact
//! (more confirmations, a settlement callback) replaces the held one but
//! keeps the original `first_seen`, so the observation window is measured
//! from the first sighting.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ledger_core::IdentityKey;
use rail_adapters::Observation;

/// Held rail fact
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// Latest observation
    pub observation: Observation,
    /// First sighting
    pub first_seen: DateTime<Utc>,
    /// Last time the tracker looked at it
    pub last_checked: DateTime<Utc>,
    /// Number of re-evaluations
    pub checks: u32,
}

impl PendingEvent {
    /// Idempotency key
    pub fn key(&self) -> IdentityKey {
        self.observation.event.identity_key()
    }
}

/// Result of holding a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// First time held
    Inserted,
    /// Replaced an earlier observation of the same fact
    Updated,
}

/// Bounded pending queue
#[derive(Debug)]
pub struct PendingQueue {
    entries: DashMap<IdentityKey, PendingEvent>,
    capacity: usize,
}

impl PendingQueue {
    /// Create queue holding at most `capacity` facts
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hold a pending observation
    ///
    /// Fails with `PendingQueueFull` for a new key when at capacity; updates
    /// of already-held keys always succeed. The bound is checked before
    /// insertion, so concurrent holders may overshoot it by one each.
    pub fn hold(&self, observation: Observation, now: DateTime<Utc>) -> Result<HoldOutcome> {
        let key = observation.event.identity_key();

        if let Some(mut held) = self.entries.get_mut(&key) {
            held.observation = observation;
            return Ok(HoldOutcome::Updated);
        }

        if self.entries.len() >= self.capacity {
            return Err(Error::PendingQueueFull {
                capacity: self.capacity,
            });
        }

        let mut outcome = HoldOutcome::Inserted;
        self.entries
            .entry(key)
            .and_modify(|held| {
                held.observation = observation.clone();
                outcome = HoldOutcome::Updated;
            })
            .or_insert_with(|| PendingEvent {
                observation: observation.clone(),
                first_seen: now,
                last_checked: now,
                checks: 0,
            });
        Ok(outcome)
    }

    /// Remove a held fact
    pub fn remove(&self, key: &IdentityKey) -> Option<PendingEvent> {
        self.entries.remove(key).map(|(_, held)| held)
    }

    /// Copy of a held fact
    pub fn get(&self, key: &IdentityKey) -> Option<PendingEvent> {
        self.entries.get(key).map(|held| held.clone())
    }

    /// Whether a fact is held
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Facts not re-evaluated within `interval`
    pub fn due(&self, now: DateTime<Utc>, interval: Duration) -> Vec<PendingEvent> {
        let mut due: Vec<PendingEvent> = self
            .entries
            .iter()
            .filter(|held| {
                held.last_checked
                    .checked_add_signed(interval)
                    .map_or(false, |due_at| due_at <= now)
            })
            .map(|held| held.clone())
            .collect();
        due.sort_by_key(|held| held.first_seen);
        due
    }

    /// Record a re-evaluation that left the fact pending
    pub fn mark_checked(&self, key: &IdentityKey, now: DateTime<Utc>) {
        if let Some(mut held) = self.entries.get_mut(key) {
            held.last_checked = now;
            held.checks += 1;
        }
    }

    /// Remove and return facts first seen more than `window` ago
    pub fn expire(&self, now: DateTime<Utc>, window: Duration) -> Vec<PendingEvent> {
        let expired_keys: Vec<IdentityKey> = self
            .entries
            .iter()
            .filter(|held| {
                held.first_seen
                    .checked_add_signed(window)
                    .map_or(false, |expires_at| expires_at <= now)
            })
            .map(|held| held.key().clone())
            .collect();

        let mut expired: Vec<PendingEvent> = expired_keys
            .iter()
            .filter_map(|key| self.remove(key))
            .collect();
        expired.sort_by_key(|held| held.first_seen);
        expired
    }

    /// Number of held facts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
