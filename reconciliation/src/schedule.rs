//! Recurring Schedule Engine
//!
//! Sole owner of `RecurringSchedule` state. Per schedule:
//!
//! ```text
//!   Active --charge linked--> Active (next_charge_at advanced)
//!   Active --failures > max_charge_retries--> Exhausted
//!   Active | Exhausted --pause--> Paused --resume--> Active
//!   Exhausted --reactivate--> Active
//!   any --cancel--> Cancelled (terminal)
//! ```
//!
//! At most one charge per schedule is in flight. A charge still unresolved
//! after `in_flight_timeout` counts as a failed attempt. Cancelling is advisory for
//! an in-flight charge: the charge may still complete, and its donation is
//! reconciled and linked like any other, but the schedule stays cancelled.

use crate::{
    config::{duration_secs, ScheduleConfig},
    Error, Result,
};
use chrono::{DateTime, Duration, Months, Utc};
use ledger_core::{CharityRef, Currency, DonationEvent, DonorRef, MinorUnits, RailKind};
use parking_lot::RwLock;
use rail_adapters::{ChargeInitiator, ChargeRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Recurrence interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cadence {
    /// Every day
    Daily,
    /// Every 7 days
    Weekly,
    /// Same day each calendar month (clamped to month end)
    Monthly,
    /// Every 3 calendar months
    Quarterly,
    /// Every 12 calendar months
    Annually,
    /// Every `n` days
    EveryDays(u32),
}

impl Cadence {
    /// Next charge time after `from`; `None` on calendar overflow
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Daily => from.checked_add_signed(Duration::days(1)),
            Cadence::Weekly => from.checked_add_signed(Duration::weeks(1)),
            Cadence::Monthly => from.checked_add_months(Months::new(1)),
            Cadence::Quarterly => from.checked_add_months(Months::new(3)),
            Cadence::Annually => from.checked_add_months(Months::new(12)),
            Cadence::EveryDays(n) => from.checked_add_signed(Duration::days(i64::from(*n))),
        }
    }
}

/// Schedule state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    /// Charging on cadence
    Active,
    /// Suspended by the donor
    Paused,
    /// Terminal
    Cancelled,
    /// Retry ceiling reached; needs explicit reactivation
    Exhausted,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleState::Active => "Active",
            ScheduleState::Paused => "Paused",
            ScheduleState::Cancelled => "Cancelled",
            ScheduleState::Exhausted => "Exhausted",
        };
        f.write_str(s)
    }
}

/// Charge requested and not yet resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightCharge {
    /// Attempt number within the current period (1-based)
    pub attempt: u32,
    /// Processor id, once the processor accepted the charge
    pub external_id: Option<String>,
    /// When the charge was requested
    pub requested_at: DateTime<Utc>,
}

/// Recurring donation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    /// Schedule id (carried on charge metadata)
    pub schedule_id: Uuid,
    /// Donor
    pub donor_ref: DonorRef,
    /// Beneficiary
    pub charity_ref: CharityRef,
    /// Amount per period, minor units
    pub amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// Donor's designated rail
    pub rail_kind: RailKind,
    /// Interval
    pub cadence: Cadence,
    /// State
    pub state: ScheduleState,
    /// Next period's charge time
    pub next_charge_at: DateTime<Utc>,
    /// Donation linked most recently
    pub last_linked_donation_id: Option<Uuid>,
    /// Failed attempts in the current period
    pub consecutive_failures: u32,
    /// Earliest retry after a failure
    pub retry_at: Option<DateTime<Utc>>,
    /// Outstanding charge
    pub in_flight: Option<InFlightCharge>,
    /// Donations linked over the schedule's lifetime
    pub linked_count: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl RecurringSchedule {
    /// When the next attempt becomes due (ignores state)
    pub fn due_at(&self) -> DateTime<Utc> {
        self.retry_at.unwrap_or(self.next_charge_at)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ScheduleState::Active && self.in_flight.is_none() && self.due_at() <= now
    }

    fn in_flight_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.in_flight.as_ref().map_or(false, |charge| {
            charge
                .requested_at
                .checked_add_signed(timeout)
                .map_or(false, |deadline| deadline <= now)
        })
    }

    /// Count a failed attempt; returns the state afterwards
    fn record_failure(&mut self, retry: &RetryPolicy, reason: &str, now: DateTime<Utc>) -> ScheduleState {
        self.in_flight = None;

        if self.state != ScheduleState::Active {
            tracing::info!(
                schedule_id = %self.schedule_id,
                state = %self.state,
                reason,
                "Charge failure on inactive schedule"
            );
            return self.state;
        }

        self.consecutive_failures += 1;
        let retry_at = now.checked_add_signed(retry.delay(self.consecutive_failures));
        match retry_at {
            Some(retry_at) if self.consecutive_failures <= retry.max_charge_retries => {
                self.retry_at = Some(retry_at);
                tracing::warn!(
                    schedule_id = %self.schedule_id,
                    failures = self.consecutive_failures,
                    retry_at = %retry_at,
                    reason,
                    "Charge failed, retry scheduled"
                );
            }
            _ => {
                self.state = ScheduleState::Exhausted;
                self.retry_at = None;
                tracing::warn!(
                    schedule_id = %self.schedule_id,
                    failures = self.consecutive_failures,
                    reason,
                    "Schedule exhausted"
                );
            }
        }
        self.state
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            schedule_id: self.schedule_id,
            from: self.state.to_string(),
            action,
        }
    }
}

/// Donor request to start a schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    /// Donor
    pub donor_ref: DonorRef,
    /// Beneficiary
    pub charity_ref: CharityRef,
    /// Amount per period, minor units
    pub amount: MinorUnits,
    /// Currency
    pub currency: Currency,
    /// Rail to charge through
    pub rail_kind: RailKind,
    /// Interval
    pub cadence: Cadence,
    /// First charge time
    pub first_charge_at: DateTime<Utc>,
}

/// Outcome of one charge attempt started by `tick`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeAttempt {
    /// Processor accepted; the donation arrives through the rail
    Initiated {
        /// Schedule
        schedule_id: Uuid,
        /// Attempt number
        attempt: u32,
        /// Processor id
        external_id: String,
    },
    /// Processor refused; retry scheduled or schedule exhausted
    Failed {
        /// Schedule
        schedule_id: Uuid,
        /// Attempt number
        attempt: u32,
        /// Processor reason
        reason: String,
        /// State after recording the failure
        state: ScheduleState,
    },
}

/// Result of linking a confirmed donation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Period paid; `next_charge_at` advanced
    Advanced(DateTime<Utc>),
    /// Recorded without advancing (schedule cancelled or exhausted)
    Recorded,
    /// Donation was already linked
    AlreadyLinked,
}

/// Exponential retry delay for failed charges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated before the schedule is exhausted
    pub max_charge_retries: u32,
    /// First retry delay
    pub base: Duration,
    /// Delay ceiling
    pub max: Duration,
    /// Age at which an unresolved charge counts as failed
    pub in_flight_timeout: Duration,
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure: `base * 2^(failures-1)`, capped
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl From<&ScheduleConfig> for RetryPolicy {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            max_charge_retries: config.max_charge_retries,
            base: duration_secs(config.retry_base_secs),
            max: duration_secs(config.retry_max_secs),
            in_flight_timeout: duration_secs(config.in_flight_timeout_secs),
        }
    }
}

/// Recurring Schedule Engine
pub struct ScheduleEngine {
    schedules: RwLock<HashMap<Uuid, RecurringSchedule>>,
    initiators: RwLock<HashMap<RailKind, Arc<dyn ChargeInitiator>>>,
    retry: RetryPolicy,
}

impl fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleEngine")
            .field("schedules", &self.schedules.read().len())
            .field("rails", &self.initiators.read().keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish()
    }
}

impl ScheduleEngine {
    /// Create engine with a retry policy
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            initiators: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Route charges for `rail_kind` through `initiator`
    pub fn register_initiator(&self, rail_kind: RailKind, initiator: Arc<dyn ChargeInitiator>) {
        self.initiators.write().insert(rail_kind, initiator);
    }

    /// Start a schedule
    pub fn create(&self, request: ScheduleRequest) -> Result<RecurringSchedule> {
        if request.amount <= 0 {
            return Err(Error::InvalidSchedule(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if let Cadence::EveryDays(0) = request.cadence {
            return Err(Error::InvalidSchedule("cadence of zero days".to_string()));
        }
        if !self.initiators.read().contains_key(&request.rail_kind) {
            return Err(Error::InvalidSchedule(format!(
                "no charge initiator for rail {}",
                request.rail_kind
            )));
        }

        let schedule = RecurringSchedule {
            schedule_id: Uuid::now_v7(),
            donor_ref: request.donor_ref,
            charity_ref: request.charity_ref,
            amount: request.amount,
            currency: request.currency,
            rail_kind: request.rail_kind,
            cadence: request.cadence,
            state: ScheduleState::Active,
            next_charge_at: request.first_charge_at,
            last_linked_donation_id: None,
            consecutive_failures: 0,
            retry_at: None,
            in_flight: None,
            linked_count: 0,
            created_at: Utc::now(),
        };

        tracing::info!(
            schedule_id = %schedule.schedule_id,
            donor_ref = %schedule.donor_ref,
            charity_ref = %schedule.charity_ref,
            amount = schedule.amount,
            cadence = ?schedule.cadence,
            "Schedule created"
        );
        self.schedules
            .write()
            .insert(schedule.schedule_id, schedule.clone());
        Ok(schedule)
    }

    /// Donor pause (Active or Exhausted)
    pub fn pause(&self, schedule_id: Uuid) -> Result<RecurringSchedule> {
        self.transition(schedule_id, "pause", |schedule, _| match schedule.state {
            ScheduleState::Active | ScheduleState::Exhausted | ScheduleState::Paused => {
                schedule.state = ScheduleState::Paused;
                Ok(())
            }
            ScheduleState::Cancelled => Err(schedule.invalid("pause")),
        })
    }

    /// Donor resume (Paused only); a missed period is charged on the next tick
    pub fn resume(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<RecurringSchedule> {
        self.transition(schedule_id, "resume", |schedule, retry| match schedule.state {
            ScheduleState::Paused => {
                schedule.state = ScheduleState::Active;
                if schedule.consecutive_failures > retry.max_charge_retries {
                    schedule.consecutive_failures = 0;
                    schedule.retry_at = None;
                }
                if schedule.next_charge_at < now {
                    schedule.next_charge_at = now;
                }
                Ok(())
            }
            _ => Err(schedule.invalid("resume")),
        })
    }

    /// Donor cancel (terminal; in-flight charges still reconcile)
    pub fn cancel(&self, schedule_id: Uuid) -> Result<RecurringSchedule> {
        self.transition(schedule_id, "cancel", |schedule, _| {
            schedule.state = ScheduleState::Cancelled;
            schedule.retry_at = None;
            Ok(())
        })
    }

    /// Explicit reactivation of an Exhausted schedule
    pub fn reactivate(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<RecurringSchedule> {
        self.transition(schedule_id, "reactivate", |schedule, _| match schedule.state {
            ScheduleState::Exhausted => {
                schedule.state = ScheduleState::Active;
                schedule.consecutive_failures = 0;
                schedule.retry_at = None;
                if schedule.next_charge_at < now {
                    schedule.next_charge_at = now;
                }
                Ok(())
            }
            _ => Err(schedule.invalid("reactivate")),
        })
    }

    fn transition(
        &self,
        schedule_id: Uuid,
        action: &'static str,
        apply: impl FnOnce(&mut RecurringSchedule, &RetryPolicy) -> Result<()>,
    ) -> Result<RecurringSchedule> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(Error::ScheduleNotFound(schedule_id))?;
        let from = schedule.state;
        apply(schedule, &self.retry)?;

        tracing::info!(
            schedule_id = %schedule_id,
            action,
            from = %from,
            to = %schedule.state,
            "Schedule transition"
        );
        Ok(schedule.clone())
    }

    /// Start a charge for every due schedule
    ///
    /// Due means Active, nothing in flight, and `retry_at` (or, without a
    /// pending retry, `next_charge_at`) reached. The in-flight marker is set
    /// before the processor is called, so overlapping ticks never double
    /// charge.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<ChargeAttempt> {
        let mut attempts = Vec::new();
        let requests: Vec<(ChargeRequest, Option<Arc<dyn ChargeInitiator>>)> = {
            let initiators = self.initiators.read();
            let mut schedules = self.schedules.write();

            for schedule in schedules.values_mut() {
                if !schedule.in_flight_expired(now, self.retry.in_flight_timeout) {
                    continue;
                }
                let attempt = schedule.in_flight.as_ref().map_or(0, |charge| charge.attempt);
                let reason = "charge unresolved past the in-flight timeout".to_string();
                let state = schedule.record_failure(&self.retry, &reason, now);
                attempts.push(ChargeAttempt::Failed {
                    schedule_id: schedule.schedule_id,
                    attempt,
                    reason,
                    state,
                });
            }

            schedules
                .values_mut()
                .filter(|schedule| schedule.is_due(now))
                .map(|schedule| {
                    let attempt = schedule.consecutive_failures + 1;
                    schedule.in_flight = Some(InFlightCharge {
                        attempt,
                        external_id: None,
                        requested_at: now,
                    });
                    let request = ChargeRequest {
                        schedule_id: schedule.schedule_id,
                        attempt,
                        donor_ref: schedule.donor_ref.clone(),
                        charity_ref: schedule.charity_ref.clone(),
                        amount: schedule.amount,
                        currency: schedule.currency,
                        rail_kind: schedule.rail_kind,
                        requested_at: now,
                    };
                    (request, initiators.get(&schedule.rail_kind).cloned())
                })
                .collect()
        };

        for (request, initiator) in requests {
            let result = match initiator {
                Some(initiator) => initiator.initiate(&request).await,
                None => Err(rail_adapters::Error::ChargeFailed(format!(
                    "no charge initiator for rail {}",
                    request.rail_kind
                ))),
            };

            let attempt = match result {
                Ok(receipt) => {
                    if let Some(schedule) = self.schedules.write().get_mut(&request.schedule_id) {
                        if let Some(in_flight) = schedule.in_flight.as_mut() {
                            in_flight.external_id = Some(receipt.external_id.clone());
                        }
                    }
                    tracing::info!(
                        schedule_id = %request.schedule_id,
                        attempt = request.attempt,
                        external_id = %receipt.external_id,
                        "Scheduled charge initiated"
                    );
                    ChargeAttempt::Initiated {
                        schedule_id: request.schedule_id,
                        attempt: request.attempt,
                        external_id: receipt.external_id,
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    let state = self
                        .fail(request.schedule_id, &reason, now)
                        .unwrap_or(ScheduleState::Cancelled);
                    ChargeAttempt::Failed {
                        schedule_id: request.schedule_id,
                        attempt: request.attempt,
                        reason,
                        state,
                    }
                }
            };
            attempts.push(attempt);
        }
        attempts
    }

    /// Link a confirmed donation to the schedule named in its metadata
    pub fn link(&self, event: &DonationEvent, donation_id: Uuid) -> Result<LinkOutcome> {
        let schedule_id = event
            .schedule_id
            .ok_or_else(|| Error::InvalidSchedule(format!("event {} carries no schedule", event.external_id)))?;

        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(Error::ScheduleNotFound(schedule_id))?;

        if schedule.last_linked_donation_id == Some(donation_id) {
            return Ok(LinkOutcome::AlreadyLinked);
        }

        schedule.last_linked_donation_id = Some(donation_id);
        schedule.linked_count += 1;
        schedule.in_flight = None;

        let outcome = match schedule.state {
            ScheduleState::Active | ScheduleState::Paused => {
                schedule.consecutive_failures = 0;
                schedule.retry_at = None;
                match schedule.cadence.advance(schedule.next_charge_at) {
                    Some(next) => {
                        schedule.next_charge_at = next;
                        LinkOutcome::Advanced(next)
                    }
                    None => {
                        tracing::error!(schedule_id = %schedule_id, "Cadence overflow, schedule exhausted");
                        schedule.state = ScheduleState::Exhausted;
                        LinkOutcome::Recorded
                    }
                }
            }
            ScheduleState::Cancelled | ScheduleState::Exhausted => LinkOutcome::Recorded,
        };

        tracing::info!(
            schedule_id = %schedule_id,
            donation_id = %donation_id,
            external_id = %event.external_id,
            state = %schedule.state,
            next_charge_at = %schedule.next_charge_at,
            "Donation linked to schedule"
        );
        Ok(outcome)
    }

    /// Record a failed charge (refused, declined, or reverted before confirming)
    pub fn record_charge_failure(
        &self,
        schedule_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleState> {
        self.fail(schedule_id, reason, now)
    }

    fn fail(&self, schedule_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<ScheduleState> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or(Error::ScheduleNotFound(schedule_id))?;
        Ok(schedule.record_failure(&self.retry, reason, now))
    }

    /// Current schedule state
    pub fn status(&self, schedule_id: Uuid) -> Result<RecurringSchedule> {
        self.schedules
            .read()
            .get(&schedule_id)
            .cloned()
            .ok_or(Error::ScheduleNotFound(schedule_id))
    }

    /// All schedules of a donor
    pub fn for_donor(&self, donor_ref: &DonorRef) -> Vec<RecurringSchedule> {
        let mut schedules: Vec<RecurringSchedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| &s.donor_ref == donor_ref)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        schedules
    }

    /// Number of schedules
    pub fn len(&self) -> usize {
        self.schedules.read().len()
    }

    /// Whether no schedule exists
    pub fn is_empty(&self) -> bool {
        self.schedules.read().is_empty()
    }
}
