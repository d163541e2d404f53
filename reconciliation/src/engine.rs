//! Reconciliation Engine
//!
//! Drains rail adapters and routes each fact through the pipeline:
//!
//! ```text
//! normalize -> classify (Finality Tracker)
//!   Pending   -> pending queue (rechecked until Confirmed, Reverted or Expired)
//!   Confirmed -> charity check -> reserve identity -> ledger credit -> projector -> schedule link
//!   Reverted  -> ledger compensation (or drop, if nothing was ever confirmed)
//! ```
//!
//! Per-fact failures are isolated: malformed payloads, unmapped currencies,
//! unverified charities and out-of-order compensations go to the review
//! queue and the worker moves on. Only infrastructure failures (ledger
//! unavailable, pending queue full) stop a batch, and then the adapter
//! cursor is rewound so the rail redelivers from the first unprocessed fact.

use crate::{
    config::{duration_secs, ReconcilerConfig},
    directory::CharityDirectory,
    finality::FinalityPolicy,
    metrics::EngineMetrics,
    pending::PendingQueue,
    review::{ReviewQueue, ReviewReason},
    schedule::{ChargeAttempt, RetryPolicy, ScheduleEngine},
    Error, Result,
};
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use impact_projector::{NotificationSink, Projector};
use ledger_core::{
    AppendOutcome, DonationBalance, DonationEvent, FinalityState, IdentityKey, Ledger, Posting,
    Reservation,
};
use rail_adapters::{Observation, RailAdapter, RailCursor, RailSignal, RawRailMessage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the engine did with one rail fact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Held pending finality
    Held,
    /// Ledger entry written (credit, reconfirmation or compensation)
    Posted {
        /// Donation
        donation_id: Uuid,
        /// Ledger sequence
        sequence: u64,
    },
    /// Ledger already reflects this fact
    AlreadyExists {
        /// Donation
        donation_id: Uuid,
    },
    /// Reverted before anything was confirmed; nothing to post
    Dropped,
    /// Raised for manual review
    Review(ReviewReason),
}

impl Disposition {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Held => "held",
            Disposition::Posted { .. } => "posted",
            Disposition::AlreadyExists { .. } => "already_exists",
            Disposition::Dropped => "dropped",
            Disposition::Review(_) => "review",
        }
    }
}

/// Donation status as shown to donors and charities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationStatus {
    /// Awaiting finality
    Pending,
    /// Counting towards totals
    Confirmed,
    /// Reversed, or never settled
    Reverted,
    /// Pending past the observation window; under review
    Expired,
    /// Never seen
    Unknown,
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DonationStatus::Pending => "Pending",
            DonationStatus::Confirmed => "Confirmed",
            DonationStatus::Reverted => "Reverted",
            DonationStatus::Expired => "Expired",
            DonationStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Counts from one drain of an adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages handled
    pub messages: usize,
    /// Held pending
    pub held: usize,
    /// Ledger entries written
    pub posted: usize,
    /// Absorbed duplicates
    pub duplicates: usize,
    /// Reverted before confirmation
    pub dropped: usize,
    /// Raised for review
    pub reviewed: usize,
    /// Cursor the adapter was rewound to, if the batch stopped early
    pub rewound: Option<RailCursor>,
}

impl DrainReport {
    fn record(&mut self, disposition: &Disposition) {
        self.messages += 1;
        match disposition {
            Disposition::Held => self.held += 1,
            Disposition::Posted { .. } => self.posted += 1,
            Disposition::AlreadyExists { .. } => self.duplicates += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::Review(_) => self.reviewed += 1,
        }
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Pending facts re-evaluated
    pub rechecked: usize,
    /// Pending facts that posted on recheck
    pub confirmed: usize,
    /// Pending facts expired into review
    pub expired: usize,
    /// Held facts dropped because the donation had already posted
    pub stale: usize,
    /// Scheduled charges started or failed
    pub charges: Vec<ChargeAttempt>,
}

/// Outcome of a fact that never reached the ledger
#[derive(Debug, Clone, Copy)]
struct TerminalOutcome {
    status: DonationStatus,
    recorded_at: DateTime<Utc>,
}

/// Reconciliation Engine
pub struct ReconciliationEngine {
    ledger: Arc<Ledger>,
    finality: FinalityPolicy,
    pending: PendingQueue,
    schedules: ScheduleEngine,
    directory: Arc<dyn CharityDirectory>,
    projector: Projector,
    review: ReviewQueue,
    /// Pruned after `pending.outcome_retention_secs`
    outcomes: DashMap<IdentityKey, TerminalOutcome>,
    metrics: EngineMetrics,
    config: ReconcilerConfig,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("service_name", &self.config.service_name)
            .field("pending", &self.pending.len())
            .field("review", &self.review.len())
            .field("schedules", &self.schedules)
            .finish()
    }
}

impl ReconciliationEngine {
    /// Open the ledger and build the engine
    pub async fn new(
        config: ReconcilerConfig,
        directory: Arc<dyn CharityDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(Ledger::open(config.ledger.clone()).await?);
        Self::with_ledger(ledger, config, directory, sink)
    }

    /// Build the engine over an open ledger
    ///
    /// The projector is rebuilt from a full replay, so receipts issued
    /// before a restart are not re-notified.
    pub fn with_ledger(
        ledger: Arc<Ledger>,
        config: ReconcilerConfig,
        directory: Arc<dyn CharityDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let projector = Projector::new(sink);
        projector.rebuild(&ledger)?;

        tracing::info!(
            service = %config.service_name,
            pending_capacity = config.pending.capacity,
            next_sequence = projector.read(|p| p.next_sequence()),
            "Reconciliation engine ready"
        );

        Ok(Self {
            pending: PendingQueue::new(config.pending.capacity),
            schedules: ScheduleEngine::new(RetryPolicy::from(&config.schedules)),
            finality: config.finality.clone(),
            review: ReviewQueue::new(),
            outcomes: DashMap::new(),
            metrics: EngineMetrics::new()?,
            ledger,
            directory,
            projector,
            config,
        })
    }

    /// Process one normalized fact now
    pub async fn process(&self, observation: Observation) -> Result<Disposition> {
        self.process_at(observation, Utc::now()).await
    }

    /// Process one normalized fact at `now`
    pub async fn process_at(
        &self,
        mut observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<Disposition> {
        let state = match self
            .finality
            .classify_at(&observation.event, &observation.signal, now)
        {
            Ok(state) => state,
            Err(Error::MissingFinalityPolicy(rail)) => {
                let detail = format!("no finality policy for rail {}", rail);
                let disposition = self.raise(ReviewReason::MissingPolicy, &observation.event, detail);
                self.metrics.record_event(disposition.label());
                return Ok(disposition);
            }
            Err(e) => return Err(e),
        };
        observation.event.finality_state = state;
        let key = observation.event.identity_key();
        let signal = observation.signal;

        let disposition = match state {
            FinalityState::Pending => self.hold(observation, now)?,
            FinalityState::Confirmed => {
                self.release(&key);
                self.confirm(&observation.event).await?
            }
            FinalityState::Reverted => self.revert(&observation, now).await?,
        };

        tracing::debug!(
            key = %key,
            signal = ?signal,
            disposition = ?disposition,
            "Rail fact processed"
        );
        self.metrics.record_event(disposition.label());
        Ok(disposition)
    }

    fn hold(&self, observation: Observation, now: DateTime<Utc>) -> Result<Disposition> {
        let key = observation.event.identity_key();

        // A shallower report of an already-confirmed fact changes nothing
        if let Some(balance) = self.confirmed_balance(&key)? {
            return Ok(Disposition::AlreadyExists {
                donation_id: balance.donation_id,
            });
        }

        self.pending.hold(observation, now)?;

        // A concurrent worker may have posted between the check and the hold
        if let Some(balance) = self.confirmed_balance(&key)? {
            self.release(&key);
            return Ok(Disposition::AlreadyExists {
                donation_id: balance.donation_id,
            });
        }

        self.outcomes.remove(&key);
        self.metrics.pending.set(self.pending.len() as i64);
        Ok(Disposition::Held)
    }

    fn release(&self, key: &IdentityKey) {
        if self.pending.remove(key).is_some() {
            self.metrics.pending.set(self.pending.len() as i64);
        }
    }

    async fn confirm(&self, event: &DonationEvent) -> Result<Disposition> {
        match self.directory.get_charity(&event.charity_ref).await? {
            None => {
                let detail = format!("charity {} not in directory", event.charity_ref);
                return Ok(self.raise(ReviewReason::UnknownCharity, event, detail));
            }
            Some(record) if !record.verified => {
                let detail = format!("charity {} is not verified", event.charity_ref);
                return Ok(self.raise(ReviewReason::UnverifiedCharity, event, detail));
            }
            Some(_) => {}
        }

        let reservation = self
            .ledger
            .identities()
            .reserve(event.rail_kind, &event.external_id)?;
        let donation_id = reservation.donation_id();

        if let Reservation::AlreadyExists(existing) = reservation {
            if self.ledger.balance(&existing)?.map_or(false, |b| b.is_confirmed()) {
                tracing::debug!(
                    donation_id = %existing,
                    rail = %event.rail_kind,
                    external_id = %event.external_id,
                    "Duplicate delivery absorbed"
                );
                return Ok(Disposition::AlreadyExists {
                    donation_id: existing,
                });
            }
        }

        match self.ledger.append(Posting::credit(donation_id, event)).await {
            Ok(AppendOutcome::Appended(entry)) => {
                let key = event.identity_key();
                // Clears a hold that raced ahead of the append
                self.release(&key);
                self.outcomes.remove(&key);
                self.catch_up_projector();
                if event.schedule_id.is_some() {
                    self.link_schedule(event, donation_id);
                }
                Ok(Disposition::Posted {
                    donation_id,
                    sequence: entry.sequence,
                })
            }
            Ok(AppendOutcome::Duplicate { donation_id, .. }) => {
                Ok(Disposition::AlreadyExists { donation_id })
            }
            Err(ledger_core::Error::IdentityConflict(detail)) => {
                Ok(self.raise(ReviewReason::IdentityConflict, event, detail))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn revert(&self, observation: &Observation, now: DateTime<Utc>) -> Result<Disposition> {
        let event = &observation.event;
        let key = event.identity_key();
        let was_pending = self.pending.remove(&key).is_some();
        self.metrics.pending.set(self.pending.len() as i64);

        let balance = match self
            .ledger
            .identities()
            .lookup(event.rail_kind, &event.external_id)?
        {
            Some(donation_id) => self.ledger.balance(&donation_id)?,
            None => None,
        };

        let Some(balance) = balance else {
            if was_pending || observation.signal == RailSignal::Declined {
                tracing::info!(
                    rail = %event.rail_kind,
                    external_id = %event.external_id,
                    signal = ?observation.signal,
                    "Reverted before confirmation, nothing to compensate"
                );
                self.record_outcome(key, DonationStatus::Reverted, now);
                if let Some(schedule_id) = event.schedule_id {
                    let reason = format!("{:?} before confirmation", observation.signal);
                    self.fail_scheduled_charge(schedule_id, &reason, now);
                }
                return Ok(Disposition::Dropped);
            }
            let detail = "reversal for a donation with no confirmed entry".to_string();
            return Ok(self.raise(ReviewReason::OutOfOrderCompensation, event, detail));
        };

        match self
            .ledger
            .append(Posting::compensation(balance.donation_id, event))
            .await
        {
            Ok(AppendOutcome::Appended(entry)) => {
                self.catch_up_projector();
                Ok(Disposition::Posted {
                    donation_id: entry.donation_id,
                    sequence: entry.sequence,
                })
            }
            Ok(AppendOutcome::Duplicate { donation_id, .. }) => {
                Ok(Disposition::AlreadyExists { donation_id })
            }
            Err(ledger_core::Error::OutOfOrderCompensation(detail)) => {
                Ok(self.raise(ReviewReason::OutOfOrderCompensation, event, detail))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn confirmed_balance(&self, key: &IdentityKey) -> Result<Option<DonationBalance>> {
        let Some(donation_id) = self
            .ledger
            .identities()
            .lookup(key.rail_kind, &key.external_id)?
        else {
            return Ok(None);
        };
        Ok(self
            .ledger
            .balance(&donation_id)?
            .filter(|balance| balance.is_confirmed()))
    }

    fn record_outcome(&self, key: IdentityKey, status: DonationStatus, now: DateTime<Utc>) {
        self.outcomes.insert(
            key,
            TerminalOutcome {
                status,
                recorded_at: now,
            },
        );
    }

    fn fail_scheduled_charge(&self, schedule_id: Uuid, reason: &str, now: DateTime<Utc>) {
        if let Err(e) = self.schedules.record_charge_failure(schedule_id, reason, now) {
            tracing::warn!(schedule_id = %schedule_id, error = %e, "Charge failure not recorded");
        }
    }

    fn already_posted(&self, key: &IdentityKey) -> bool {
        match self.confirmed_balance(key) {
            Ok(balance) => balance.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ledger lookup failed during maintenance");
                false
            }
        }
    }

    fn link_schedule(&self, event: &DonationEvent, donation_id: Uuid) {
        match self.schedules.link(event, donation_id) {
            Ok(outcome) => tracing::debug!(donation_id = %donation_id, outcome = ?outcome, "Schedule linkage"),
            // The donation counts either way; the schedule just misses the link
            Err(e) => tracing::warn!(
                donation_id = %donation_id,
                schedule_id = ?event.schedule_id,
                error = %e,
                "Confirmed charge not linked to a schedule"
            ),
        }
    }

    fn catch_up_projector(&self) {
        // Projection is derived; the next pass heals a failed catch-up
        if let Err(e) = self.projector.catch_up(&self.ledger) {
            tracing::error!(error = %e, "Projector catch-up failed");
        }
    }

    fn raise(&self, reason: ReviewReason, event: &DonationEvent, detail: impl Into<String>) -> Disposition {
        self.review.raise_event(reason, event, detail);
        self.metrics.record_review(reason);
        Disposition::Review(reason)
    }

    /// Handle one raw message: normalize, then process
    pub async fn handle_message(
        &self,
        message: &RawRailMessage,
        normalized: rail_adapters::Result<Observation>,
    ) -> Result<Disposition> {
        match normalized {
            Ok(observation) => self.process(observation).await,
            Err(e) => {
                let reason = match e {
                    rail_adapters::Error::UnsupportedCurrency(_) => ReviewReason::UnsupportedCurrency,
                    _ => ReviewReason::Malformed,
                };
                self.review.raise(
                    reason,
                    message.rail_kind,
                    format!("cursor {}: {}", message.cursor, e),
                );
                self.metrics.record_review(reason);
                self.metrics.record_event("review");
                Ok(Disposition::Review(reason))
            }
        }
    }

    /// Process everything the adapter has, acknowledging as batches complete
    ///
    /// Stops early (and rewinds the adapter) when a fact cannot be processed
    /// for infrastructure reasons; the rail will redeliver from there.
    pub async fn drain(&self, adapter: &mut dyn RailAdapter) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let batch = adapter.poll_or_receive().await?;
            if batch.is_empty() {
                break;
            }

            let mut committed = None;
            for message in &batch {
                let normalized = adapter.normalize(message);
                match self.handle_message(message, normalized).await {
                    Ok(disposition) => {
                        report.record(&disposition);
                        committed = Some(message.cursor.next());
                    }
                    Err(e) => {
                        tracing::warn!(
                            rail = %adapter.rail_kind(),
                            adapter = adapter.name(),
                            cursor = %message.cursor,
                            error = %e,
                            "Batch stopped, rewinding rail cursor"
                        );
                        adapter.seek(message.cursor);
                        report.rewound = Some(message.cursor);
                        break;
                    }
                }
            }

            if let Some(cursor) = committed {
                adapter.acknowledge(cursor).await?;
            }
            if report.rewound.is_some() {
                break;
            }
        }

        Ok(report)
    }

    /// Recheck due pending facts, expire stale ones, tick schedules
    pub async fn maintain(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let recheck = duration_secs(self.config.pending.recheck_interval_secs);
        let window = duration_secs(self.config.pending.observation_window_secs);
        let retention = duration_secs(self.config.pending.outcome_retention_secs);

        for held in self.pending.due(now, recheck) {
            let key = held.key();
            if self.already_posted(&key) {
                self.release(&key);
                report.stale += 1;
                continue;
            }
            report.rechecked += 1;
            let state = self
                .finality
                .classify_at(&held.observation.event, &held.observation.signal, now);

            match state {
                Ok(FinalityState::Pending) => self.pending.mark_checked(&key, now),
                Ok(_) => match self.process_at(held.observation, now).await {
                    Ok(Disposition::Posted { .. }) => report.confirmed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Recheck failed, will retry");
                        self.pending.mark_checked(&key, now);
                    }
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Pending fact cannot be classified");
                    self.pending.mark_checked(&key, now);
                }
            }
        }

        for held in self.pending.expire(now, window) {
            let key = held.key();
            if self.already_posted(&key) {
                report.stale += 1;
                continue;
            }
            // The rail fact survives in the review item; only active retry stops
            self.record_outcome(key, DonationStatus::Expired, now);
            if let Some(schedule_id) = held.observation.event.schedule_id {
                self.fail_scheduled_charge(schedule_id, "charge unconfirmed past the observation window", now);
            }
            self.review.raise_event(
                ReviewReason::Expired,
                &held.observation.event,
                format!(
                    "pending since {} after {} checks",
                    held.first_seen.to_rfc3339(),
                    held.checks
                ),
            );
            self.metrics.expired_total.inc();
            self.metrics.record_review(ReviewReason::Expired);
            report.expired += 1;
        }
        self.metrics.pending.set(self.pending.len() as i64);

        self.outcomes.retain(|_, outcome| {
            outcome
                .recorded_at
                .checked_add_signed(retention)
                .map_or(true, |forget_at| forget_at > now)
        });

        report.charges = self.schedules.tick(now).await;
        self.catch_up_projector();

        if report.rechecked + report.expired + report.stale + report.charges.len() > 0 {
            tracing::info!(
                rechecked = report.rechecked,
                confirmed = report.confirmed,
                expired = report.expired,
                stale = report.stale,
                charges = report.charges.len(),
                "Maintenance pass"
            );
        }
        report
    }

    /// Run one worker per adapter plus the maintenance loop until cancelled
    pub async fn run(
        self: Arc<Self>,
        adapters: Vec<Box<dyn RailAdapter>>,
        token: CancellationToken,
    ) -> Result<()> {
        let mut handles = Vec::with_capacity(adapters.len() + 1);
        for adapter in adapters {
            handles.push(tokio::spawn(
                self.clone().run_worker(adapter, token.child_token()),
            ));
        }
        handles.push(tokio::spawn(self.clone().run_maintenance(token.child_token())));

        token.cancelled().await;
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Engine task ended abnormally");
            }
        }

        tracing::info!("Reconciliation engine stopped");
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, mut adapter: Box<dyn RailAdapter>, token: CancellationToken) {
        let workers = &self.config.workers;
        let poll_interval = std::time::Duration::from_millis(workers.poll_interval_ms);
        let max_backoff = std::time::Duration::from_millis(workers.backoff_max_ms);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(workers.backoff_initial_ms))
            .with_max_interval(max_backoff)
            .with_max_elapsed_time(None)
            .build();

        tracing::info!(
            rail = %adapter.rail_kind(),
            adapter = adapter.name(),
            cursor = %adapter.cursor(),
            "Rail worker started"
        );

        loop {
            let delay = match self.drain(adapter.as_mut()).await {
                Ok(report) => {
                    backoff.reset();
                    if report.messages > 0 {
                        tracing::info!(
                            rail = %adapter.rail_kind(),
                            messages = report.messages,
                            posted = report.posted,
                            held = report.held,
                            duplicates = report.duplicates,
                            reviewed = report.reviewed,
                            "Rail batch reconciled"
                        );
                    }
                    poll_interval
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(max_backoff);
                    tracing::warn!(
                        rail = %adapter.rail_kind(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Rail poll failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(rail = %adapter.rail_kind(), adapter = adapter.name(), "Rail worker stopped");
    }

    async fn run_maintenance(self: Arc<Self>, token: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.pending.recheck_interval_secs);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.maintain(Utc::now()).await;
                }
            }
        }
    }

    /// Stop the ledger writer
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down reconciliation engine");
        self.ledger.shutdown().await?;
        Ok(())
    }

    /// Ledger
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Recurring Schedule Engine
    pub fn schedules(&self) -> &ScheduleEngine {
        &self.schedules
    }

    /// Impact & Receipt Projector
    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    /// Operational review queue
    pub fn review(&self) -> &ReviewQueue {
        &self.review
    }

    /// Pending queue
    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    /// Finality policy in force
    pub fn finality(&self) -> &FinalityPolicy {
        &self.finality
    }

    /// Metrics
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub(crate) fn outcome(&self, key: &IdentityKey) -> Option<DonationStatus> {
        self.outcomes.get(key).map(|outcome| outcome.status)
    }
}
