//! Actor-based concurrency for the ledger
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One logical writer task is the only sequencer in the system
//! - Compensation ordering and duplicate checks run inside the writer, so
//!   they are atomic with respect to every other append
//! - Async message passing with backpressure (bounded mailbox)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Rail workers (one or more per rail)          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ Posting
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │  next_sequence, chain head                            │
//! │  validate → build entry → hash chain                  │
//! │                       │                               │
//! │                       ▼                               │
//! │         Storage::append_entry_atomic()                │
//! │          (one WriteBatch to RocksDB)                  │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::crypto::chain_hash;
use crate::metrics::Metrics;
use crate::types::{
    AppendOutcome, Digest32, DonationBalance, DuplicateReason, EntryKind, LedgerEntry, Posting,
};
use crate::{Error, Result, Storage};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Append a posting
    Append {
        posting: Posting,
        response: oneshot::Sender<Result<AppendOutcome>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns sequence assignment
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Next sequence to assign
    next_sequence: u64,

    /// Hash of the last appended entry
    last_hash: Digest32,

    /// Metrics
    metrics: Metrics,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor")
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl LedgerActor {
    /// Create new actor, restoring the chain head from storage
    pub fn new(
        storage: Arc<Storage>,
        mailbox: mpsc::Receiver<LedgerMessage>,
        metrics: Metrics,
    ) -> Result<Self> {
        let (next_sequence, last_hash) = match storage.last_entry()? {
            Some(last) => (last.sequence + 1, last.entry_hash),
            None => (0, [0u8; 32]),
        };

        tracing::info!(next_sequence, "Ledger writer restored chain head");

        Ok(Self {
            storage,
            mailbox,
            next_sequence,
            last_hash,
            metrics,
        })
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Append { posting, response } => {
                    let started = Instant::now();
                    let result = self.append(posting);
                    self.metrics
                        .record_append_duration(started.elapsed().as_secs_f64());

                    if let Err(e) = &result {
                        tracing::error!(error = %e, "Ledger append failed");
                    }
                    let _ = response.send(result);
                }
                LedgerMessage::Shutdown => break,
            }
        }

        tracing::info!(next_sequence = self.next_sequence, "Ledger writer stopped");
    }

    /// Validate a posting and write the resulting entry
    fn append(&mut self, posting: Posting) -> Result<AppendOutcome> {
        let donation_id = posting.donation_id();
        let event_ref = posting.event_ref().clone();

        let existing = self.storage.get_balance(&donation_id)?;

        if let Some(applied_at) = self.storage.payload_sequence(&event_ref.raw_payload_hash)? {
            // A chain re-inclusion can repeat the original payload byte for
            // byte; it reapplies once a compensation has followed it
            let reincluded = matches!(posting, Posting::Credit { .. })
                && existing
                    .as_ref()
                    .map_or(false, |b| !b.is_confirmed() && b.last_sequence > applied_at);
            if !reincluded {
                return Ok(self.duplicate(donation_id, DuplicateReason::PayloadAlreadyApplied));
            }
        }

        let now = Utc::now();
        let sequence = self.next_sequence;

        let (kind, net_amount, balance) = match posting {
            Posting::Credit {
                amount,
                currency,
                donor_ref,
                charity_ref,
                schedule_id,
                message,
                ..
            } => {
                if amount <= 0 {
                    return Err(Error::InvalidPosting(format!(
                        "credit for donation {} must be positive, got {}",
                        donation_id, amount
                    )));
                }

                match existing {
                    None => (
                        EntryKind::Donation,
                        amount,
                        DonationBalance {
                            donation_id,
                            net_amount: amount,
                            currency,
                            donor_ref,
                            charity_ref,
                            schedule_id,
                            message,
                            confirmations: 1,
                            compensations: 0,
                            first_confirmed_at: now,
                            last_sequence: sequence,
                        },
                    ),
                    Some(balance) if balance.is_confirmed() => {
                        return Ok(self.duplicate(donation_id, DuplicateReason::AlreadyConfirmed));
                    }
                    Some(mut balance) => {
                        if balance.currency != currency || balance.charity_ref != charity_ref {
                            return Err(Error::IdentityConflict(format!(
                                "reconfirmation of donation {} changes currency or charity",
                                donation_id
                            )));
                        }
                        balance.net_amount += amount;
                        balance.confirmations += 1;
                        if message.is_some() {
                            balance.message = message;
                        }
                        balance.last_sequence = sequence;
                        (EntryKind::Reconfirmation, amount, balance)
                    }
                }
            }
            Posting::Compensation { .. } => match existing {
                None => {
                    return Err(Error::OutOfOrderCompensation(format!(
                        "donation {} has no confirmed entry to compensate",
                        donation_id
                    )));
                }
                Some(balance) if !balance.is_confirmed() => {
                    return Ok(self.duplicate(donation_id, DuplicateReason::AlreadyCompensated));
                }
                Some(mut balance) => {
                    let net_amount = -balance.net_amount;
                    balance.net_amount = 0;
                    balance.compensations += 1;
                    balance.last_sequence = sequence;
                    (EntryKind::Compensation, net_amount, balance)
                }
            },
        };

        let mut entry = LedgerEntry {
            sequence,
            donation_id,
            kind,
            net_amount,
            currency: balance.currency,
            donor_ref: balance.donor_ref.clone(),
            charity_ref: balance.charity_ref.clone(),
            schedule_id: balance.schedule_id,
            message: balance.message.clone(),
            event_ref,
            recorded_at: now,
            prev_hash: self.last_hash,
            entry_hash: [0u8; 32],
        };
        entry.entry_hash = chain_hash(&self.last_hash, &entry)?;

        self.storage.append_entry_atomic(&entry, &balance)?;

        self.next_sequence += 1;
        self.last_hash = entry.entry_hash;
        self.metrics.record_entry(kind);

        tracing::info!(
            sequence,
            donation_id = %donation_id,
            kind = ?kind,
            net_amount,
            charity = %entry.charity_ref,
            "Ledger entry recorded"
        );

        Ok(AppendOutcome::Appended(entry))
    }

    fn duplicate(&self, donation_id: uuid::Uuid, reason: DuplicateReason) -> AppendOutcome {
        self.metrics.record_duplicate();
        tracing::debug!(donation_id = %donation_id, reason = ?reason, "Posting absorbed as duplicate");
        AppendOutcome::Duplicate {
            donation_id,
            reason,
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    /// Append a posting
    pub async fn append(&self, posting: Posting) -> Result<AppendOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::Append {
                posting,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    mailbox_capacity: usize,
    metrics: Metrics,
) -> Result<LedgerHandle> {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let actor = LedgerActor::new(storage, rx, metrics)?;

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(LedgerHandle::new(tx))
}
