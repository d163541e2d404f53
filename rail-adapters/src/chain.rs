//! Chain rail adapter (BTC, ETH, ERC-20 stablecoins)
//!
//! Records come from a chain indexer as JSON:
//!
//! ```json
//! {"txid":"9f2c...","asset":"BTC","amount":"0.015","confirmations":3,
//!  "donor":"donor-1","charity":"charity-1","status":"included"}
//! ```
//!
//! `amount` is a decimal string in major units, as explorers report it.
//! Token transfers carry a `log_index`; the external id is then
//! `txid:log_index` so two transfers in one transaction stay distinct.

use crate::{
    rail::{FeedConsumer, RailAdapter},
    types::{Observation, RailCursor, RailSignal, RawRailMessage},
    Error, RailFeed, Result, DEFAULT_POLL_BATCH_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{CharityRef, Currency, DonationEvent, DonorRef, FinalityState, MinorUnits, RailKind};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ChainRecord {
    txid: Option<String>,
    #[serde(default)]
    log_index: Option<u32>,
    asset: Option<String>,
    amount: Option<String>,
    #[serde(default)]
    confirmations: u32,
    donor: Option<String>,
    charity: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    schedule_id: Option<Uuid>,
    #[serde(default)]
    message: Option<String>,
}

/// Adapter for one chain rail
#[derive(Debug)]
pub struct ChainAdapter {
    rail_kind: RailKind,
    consumer: FeedConsumer,
}

impl ChainAdapter {
    /// Create adapter over a feed, resuming from the consumer's acknowledged cursor
    pub fn new(feed: RailFeed, name: impl Into<String>) -> Result<Self> {
        let rail_kind = feed.rail_kind();
        if !rail_kind.is_chain() {
            return Err(Error::Config(format!("{} is not a chain rail", rail_kind)));
        }
        Ok(Self {
            rail_kind,
            consumer: FeedConsumer::resume(feed, name, DEFAULT_POLL_BATCH_SIZE),
        })
    }

    /// Assets this rail carries
    fn accepts(&self, currency: Currency) -> bool {
        match self.rail_kind {
            RailKind::Btc => currency == Currency::BTC,
            RailKind::Eth => currency == Currency::ETH,
            RailKind::Stablecoin => matches!(currency, Currency::USDC | Currency::USDT),
            RailKind::FiatCard | RailKind::FiatBank => false,
        }
    }
}

/// Convert a major-unit decimal string to exact minor units
pub fn parse_major_amount(amount: &str, currency: Currency) -> Result<MinorUnits> {
    let major = Decimal::from_str(amount.trim())
        .map_err(|e| Error::MalformedPayload(format!("invalid amount `{}`: {}", amount, e)))?;

    let scale = Decimal::from(10i64.pow(currency.exponent()));
    let minor = major
        .checked_mul(scale)
        .ok_or_else(|| Error::MalformedPayload(format!("amount `{}` overflows", amount)))?;

    if !minor.fract().is_zero() {
        return Err(Error::MalformedPayload(format!(
            "amount `{}` has more than {} decimals",
            amount,
            currency.exponent()
        )));
    }
    if minor <= Decimal::ZERO {
        return Err(Error::MalformedPayload(format!(
            "amount must be positive, got `{}`",
            amount
        )));
    }

    minor
        .to_i64()
        .ok_or_else(|| Error::MalformedPayload(format!("amount `{}` overflows", amount)))
}

fn required_str(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(Error::MalformedPayload(format!("missing field `{}`", field))),
    }
}

#[async_trait]
impl RailAdapter for ChainAdapter {
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
        let record: ChainRecord = serde_json::from_slice(&message.payload)
            .map_err(|e| Error::MalformedPayload(format!("invalid indexer record: {}", e)))?;

        let txid = required_str(record.txid, "txid")?;
        let asset = required_str(record.asset, "asset")?;
        let amount = required_str(record.amount, "amount")?;
        let donor = required_str(record.donor, "donor")?;
        let charity = required_str(record.charity, "charity")?;

        let currency = match Currency::from_code(&asset) {
            Some(currency) if self.accepts(currency) => currency,
            Some(_) => {
                return Err(Error::UnsupportedCurrency(format!(
                    "{} on {} rail",
                    asset, self.rail_kind
                )))
            }
            None => return Err(Error::UnsupportedCurrency(asset)),
        };
        let amount = parse_major_amount(&amount, currency)?;

        let signal = match record.status.as_deref() {
            None | Some("included") => RailSignal::Confirmations {
                depth: record.confirmations,
            },
            Some("reorged") => RailSignal::Reorged,
            Some(other) => {
                return Err(Error::MalformedPayload(format!("unknown status `{}`", other)))
            }
        };

        let external_id = match record.log_index {
            Some(index) => format!("{}:{}", txid, index),
            None => txid,
        };

        Ok(Observation {
            event: DonationEvent {
                external_id,
                rail_kind: self.rail_kind,
                amount,
                currency,
                donor_ref: DonorRef::new(donor),
                charity_ref: CharityRef::new(charity),
                observed_at: record.observed_at.unwrap_or(message.received_at),
                finality_state: FinalityState::Pending,
                raw_payload_hash: message.payload_hash(),
                schedule_id: record.schedule_id,
                message: record.message,
            },
            signal,
        })
    }
}
