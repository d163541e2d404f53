//! Reconciliation metrics
//!
//! - `reconciler_pending_events` - Facts currently held pending
//! - `reconciler_expired_total` - Pending facts expired into review
//! - `reconciler_review_total{reason}` - Items raised for manual review
//! - `reconciler_events_total{disposition}` - Processed rail facts

use crate::review::ReviewReason;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Engine metrics on a private registry
#[derive(Clone)]
pub struct EngineMetrics {
    /// Pending queue depth
    pub pending: IntGauge,

    /// Expired pending facts
    pub expired_total: IntCounter,

    /// Review items by reason
    pub review_total: IntCounterVec,

    /// Processed facts by disposition
    pub events_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("pending", &self.pending.get())
            .field("expired_total", &self.expired_total.get())
            .finish()
    }
}

impl EngineMetrics {
    /// Register all engine metrics
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let pending = IntGauge::new("reconciler_pending_events", "Facts currently held pending")?;
        registry.register(Box::new(pending.clone()))?;

        let expired_total = IntCounter::new(
            "reconciler_expired_total",
            "Pending facts expired into review",
        )?;
        registry.register(Box::new(expired_total.clone()))?;

        let review_total = IntCounterVec::new(
            Opts::new("reconciler_review_total", "Items raised for manual review"),
            &["reason"],
        )?;
        registry.register(Box::new(review_total.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("reconciler_events_total", "Processed rail facts"),
            &["disposition"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        Ok(Self {
            pending,
            expired_total,
            review_total,
            events_total,
            registry,
        })
    }

    /// Count a review item
    pub fn record_review(&self, reason: ReviewReason) {
        self.review_total.with_label_values(&[reason.label()]).inc();
    }

    /// Count a processed fact
    pub fn record_event(&self, disposition: &str) {
        self.events_total.with_label_values(&[disposition]).inc();
    }

    /// Registry for exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
