//! Charge initiation for recurring giving
//!
//! A charge request goes out through the donor's designated rail. The
//! processor answers synchronously (accepted / failed); the money-moved
//! fact arrives later through the rail feed like any other donation.

use crate::{Error, RailFeed, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{CharityRef, Currency, DonorRef, MinorUnits, RailKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Request to charge a donor for one schedule period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Schedule being charged
    pub schedule_id: Uuid,
    /// Attempt number within the current period (1-based)
    pub attempt: u32,
    /// Donor
    pub donor_ref: DonorRef,
    /// Beneficiary
    pub charity_ref: CharityRef,
    /// Amount in minor units
    pub amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// Rail to charge through
    pub rail_kind: RailKind,
    /// When the schedule engine asked
    pub requested_at: DateTime<Utc>,
}

/// Processor acknowledgement of an accepted charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Rail-scoped id the resulting donation event will carry
    pub external_id: String,
    /// Rail
    pub rail_kind: RailKind,
}

/// Capability to start a charge on a rail
#[async_trait]
pub trait ChargeInitiator: Send + Sync {
    /// Start a charge; `Err(ChargeFailed)` when the processor refuses it
    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeReceipt>;
}

/// Scripted behavior of the simulated processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Accept and publish a settlement webhook
    Settle,
    /// Accept, then publish a decline webhook
    Decline,
    /// Refuse synchronously
    Fail(String),
}

/// Card processor stand-in that publishes webhooks into a feed
#[derive(Debug)]
pub struct SimulatedProcessor {
    feed: RailFeed,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    next_charge: AtomicU64,
}

impl SimulatedProcessor {
    /// Processor that settles every charge unless scripted otherwise
    pub fn new(feed: RailFeed) -> Self {
        Self {
            feed,
            script: Mutex::new(VecDeque::new()),
            next_charge: AtomicU64::new(1),
        }
    }

    /// Queue outcomes for the next charges, in order
    pub fn script(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Fail the next `n` charges synchronously
    pub fn fail_next(&self, n: usize, reason: &str) {
        self.script((0..n).map(|_| ScriptedOutcome::Fail(reason.to_string())));
    }

    fn publish(&self, kind: &str, external_id: &str, request: &ChargeRequest) -> Result<()> {
        let body = serde_json::json!({
            "type": kind,
            "id": external_id,
            "amount": request.amount,
            "currency": request.currency.code(),
            "donor": request.donor_ref.as_str(),
            "charity": request.charity_ref.as_str(),
            "occurred_at": Utc::now(),
            "schedule_id": request.schedule_id,
        });
        self.feed.publish(serde_json::to_vec(&body)?);
        Ok(())
    }
}

#[async_trait]
impl ChargeInitiator for SimulatedProcessor {
    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeReceipt> {
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ScriptedOutcome::Settle);

        if let ScriptedOutcome::Fail(reason) = outcome {
            tracing::info!(
                schedule_id = %request.schedule_id,
                attempt = request.attempt,
                reason = %reason,
                "Simulated charge refused"
            );
            return Err(Error::ChargeFailed(reason));
        }

        let external_id = format!("ch_sim_{}", self.next_charge.fetch_add(1, Ordering::SeqCst));
        let kind = match outcome {
            ScriptedOutcome::Decline => "charge.declined",
            _ => "charge.settled",
        };
        self.publish(kind, &external_id, request)?;

        tracing::info!(
            schedule_id = %request.schedule_id,
            external_id = %external_id,
            kind,
            "Simulated charge accepted"
        );

        Ok(ChargeReceipt {
            external_id,
            rail_kind: self.feed.rail_kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FiatAdapter, RailAdapter, RailSignal};

    fn request() -> ChargeRequest {
        ChargeRequest {
            schedule_id: Uuid::now_v7(),
            attempt: 1,
            donor_ref: DonorRef::new("donor-1"),
            charity_ref: CharityRef::new("charity-1"),
            amount: 2500,
            currency: Currency::USD,
            rail_kind: RailKind::FiatCard,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_settled_charge_round_trips_through_adapter() {
        let feed = RailFeed::new(RailKind::FiatCard);
        let processor = SimulatedProcessor::new(feed.clone());
        let mut adapter = FiatAdapter::new(feed, "card").unwrap();
        let request = request();

        let receipt = processor.initiate(&request).await.unwrap();
        let batch = adapter.poll_or_receive().await.unwrap();
        let observation = adapter.normalize(&batch[0]).unwrap();

        assert_eq!(observation.event.external_id, receipt.external_id);
        assert_eq!(observation.event.schedule_id, Some(request.schedule_id));
        assert_eq!(observation.event.amount, 2500);
        assert!(matches!(observation.signal, RailSignal::Settled { .. }));
    }

    #[tokio::test]
    async fn test_scripted_failures_then_settle() {
        let feed = RailFeed::new(RailKind::FiatCard);
        let processor = SimulatedProcessor::new(feed.clone());
        processor.fail_next(2, "insufficient funds");

        assert!(matches!(processor.initiate(&request()).await, Err(Error::ChargeFailed(_))));
        assert!(matches!(processor.initiate(&request()).await, Err(Error::ChargeFailed(_))));
        assert!(feed.is_empty());

        processor.initiate(&request()).await.unwrap();
        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn test_decline_publishes_webhook() {
        let feed = RailFeed::new(RailKind::FiatCard);
        let processor = SimulatedProcessor::new(feed.clone());
        processor.script([ScriptedOutcome::Decline]);
        let mut adapter = FiatAdapter::new(feed, "card").unwrap();

        processor.initiate(&request()).await.unwrap();
        let batch = adapter.poll_or_receive().await.unwrap();
        assert_eq!(adapter.normalize(&batch[0]).unwrap().signal, RailSignal::Declined);
    }
}
