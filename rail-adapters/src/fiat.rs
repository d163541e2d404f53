//! Fiat rail adapter (card processor and bank transfer webhooks)
//!
//! Webhook bodies are JSON:
//!
//! ```json
//! {"type":"charge.settled","id":"ch_1","amount":5000,"currency":"USD",
//!  "donor":"donor-1","charity":"charity-1","occurred_at":"2025-03-01T12:00:00Z"}
//! ```
//!
//! `amount` is in minor units. `schedule_id` and `message` are optional.

use crate::{
    rail::{FeedConsumer, RailAdapter},
    types::{Observation, RailCursor, RailSignal, RawRailMessage},
    Error, RailFeed, Result, DEFAULT_POLL_BATCH_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{CharityRef, Currency, DonationEvent, DonorRef, FinalityState, RailKind};
use serde::Deserialize;
use uuid::Uuid;

/// Webhook body as sent by card processors and banks
#[derive(Debug, Deserialize)]
struct FiatWebhook {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
    donor: Option<String>,
    charity: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    schedule_id: Option<Uuid>,
    #[serde(default)]
    message: Option<String>,
}

/// Adapter for `FiatCard` or `FiatBank`
#[derive(Debug)]
pub struct FiatAdapter {
    rail_kind: RailKind,
    consumer: FeedConsumer,
}

impl FiatAdapter {
    /// Create adapter over a feed, resuming from the consumer's acknowledged cursor
    pub fn new(feed: RailFeed, name: impl Into<String>) -> Result<Self> {
        let rail_kind = feed.rail_kind();
        if !matches!(rail_kind, RailKind::FiatCard | RailKind::FiatBank) {
            return Err(Error::Config(format!("{} is not a fiat rail", rail_kind)));
        }
        Ok(Self {
            rail_kind,
            consumer: FeedConsumer::resume(feed, name, DEFAULT_POLL_BATCH_SIZE),
        })
    }

    fn signal_for(&self, kind: &str, at: DateTime<Utc>) -> Option<RailSignal> {
        let signal = match (self.rail_kind, kind) {
            (RailKind::FiatCard, "charge.authorized") => RailSignal::Authorized,
            (RailKind::FiatCard, "charge.settled") => RailSignal::Settled { at },
            (RailKind::FiatCard, "charge.declined") => RailSignal::Declined,
            (RailKind::FiatCard, "charge.refunded" | "charge.dispute.lost") => {
                RailSignal::Chargeback
            }
            (RailKind::FiatBank, "transfer.initiated") => RailSignal::Authorized,
            (RailKind::FiatBank, "transfer.settled") => RailSignal::Settled { at },
            (RailKind::FiatBank, "transfer.failed") => RailSignal::Declined,
            (RailKind::FiatBank, "transfer.returned") => RailSignal::Chargeback,
            _ => return None,
        };
        Some(signal)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::MalformedPayload(format!("missing field `{}`", field)))
}

fn required_str(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::MalformedPayload(format!("missing field `{}`", field))),
    }
}

#[async_trait]
impl RailAdapter for FiatAdapter {
    fn rail_kind(&self) -> RailKind {
        self.rail_kind
    }

    fn name(&self) -> &str {
        self.consumer.name()
    }

    async fn poll_or_receive(&mut self) -> Result<Vec<RawRailMessage>> {
        self.consumer.poll()
    }

    fn cursor(&self) -> RailCursor {
        self.consumer.position()
    }

    fn seek(&mut self, cursor: RailCursor) {
        self.consumer.seek(cursor);
    }

    async fn acknowledge(&mut self, cursor: RailCursor) -> Result<()> {
        self.consumer.acknowledge(cursor)
    }

    fn normalize(&self, message: &RawRailMessage) -> Result<Observation> {
        let webhook: FiatWebhook = serde_json::from_slice(&message.payload)
            .map_err(|e| Error::MalformedPayload(format!("invalid webhook body: {}", e)))?;

        let kind = required_str(webhook.kind, "type")?;
        let external_id = required_str(webhook.id, "id")?;
        let amount = required(webhook.amount, "amount")?;
        let currency_code = required_str(webhook.currency, "currency")?;
        let donor = required_str(webhook.donor, "donor")?;
        let charity = required_str(webhook.charity, "charity")?;

        if amount <= 0 {
            return Err(Error::MalformedPayload(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        let currency = match Currency::from_code(&currency_code) {
            Some(currency) if !currency.is_crypto() => currency,
            _ => return Err(Error::UnsupportedCurrency(currency_code)),
        };

        let observed_at = webhook.occurred_at.unwrap_or(message.received_at);
        let signal = self.signal_for(&kind, observed_at).ok_or_else(|| {
            Error::MalformedPayload(format!("unknown {} event type `{}`", self.rail_kind, kind))
        })?;

        Ok(Observation {
            event: DonationEvent {
                external_id,
                rail_kind: self.rail_kind,
                amount,
                currency,
                donor_ref: DonorRef::new(donor),
                charity_ref: CharityRef::new(charity),
                observed_at,
                finality_state: FinalityState::Pending,
                raw_payload_hash: message.payload_hash(),
                schedule_id: webhook.schedule_id,
                message: webhook.message,
            },
            signal,
        })
    }
}
