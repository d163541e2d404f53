//! Incremental projector
//!
//! Holds the live `Projection`, follows the ledger in sequence order and
//! forwards each newly issued receipt to the notification sink. A rebuild
//! replaces the state from a full replay without re-notifying.

use crate::{
    notify::NotificationSink,
    projection::Projection,
    receipt::Receipt,
    Result,
};
use ledger_core::{Ledger, LedgerEntry};
use parking_lot::RwLock;
use std::sync::Arc;

/// Live projection with notification fan-out
pub struct Projector {
    state: RwLock<Projection>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("next_sequence", &self.state.read().next_sequence())
            .finish()
    }
}

impl Projector {
    /// Empty projector
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            state: RwLock::new(Projection::new()),
            sink,
        }
    }

    /// Apply one entry and notify for the receipt it issues
    pub fn apply(&self, entry: &LedgerEntry) -> Result<Option<Receipt>> {
        let issued = self.state.write().apply(entry)?;
        if let Some(receipt) = &issued {
            self.notify(receipt);
        }
        Ok(issued)
    }

    /// Apply every ledger entry the projection has not seen yet
    ///
    /// Safe to call from several workers at once: the write lock is held for
    /// the whole catch-up so entries are applied strictly in sequence order.
    pub fn catch_up(&self, ledger: &Ledger) -> Result<u64> {
        let mut state = self.state.write();
        let mut issued = Vec::new();

        let from = state.next_sequence();
        ledger.replay(from, |entry| {
            if let Some(receipt) = state.apply(entry)? {
                issued.push(receipt);
            }
            Ok::<(), crate::Error>(())
        })?;
        drop(state);

        for receipt in &issued {
            self.notify(receipt);
        }
        Ok(issued.len() as u64)
    }

    /// Replace state by a full replay from sequence 0 (no notifications)
    pub fn rebuild(&self, ledger: &Ledger) -> Result<()> {
        let mut rebuilt = Projection::new();
        ledger.replay(0, |entry| {
            rebuilt.apply(entry)?;
            Ok::<(), crate::Error>(())
        })?;

        tracing::info!(
            next_sequence = rebuilt.next_sequence(),
            receipts = rebuilt.receipts().len(),
            "Projection rebuilt from ledger"
        );
        *self.state.write() = rebuilt;
        Ok(())
    }

    /// Read the projection under the lock
    pub fn read<R>(&self, f: impl FnOnce(&Projection) -> R) -> R {
        f(&self.state.read())
    }

    /// Copy of the current projection
    pub fn snapshot(&self) -> Projection {
        self.state.read().clone()
    }

    fn notify(&self, receipt: &Receipt) {
        tracing::info!(
            receipt_id = %receipt.receipt_id,
            donation_id = %receipt.donation_id,
            amount = receipt.amount,
            supersedes = ?receipt.supersedes,
            "Receipt issued"
        );
        // Projection state is authoritative; a lost notice is re-derivable
        if let Err(e) = self.sink.receipt_issued(receipt.notice()) {
            tracing::warn!(receipt_id = %receipt.receipt_id, error = %e, "Receipt notice not delivered");
        }
    }
}
