//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_entries_total` - Total number of entries appended
//! - `ledger_compensations_total` - Compensating entries appended
//! - `ledger_duplicates_total` - Postings absorbed as duplicates
//! - `ledger_append_duration_seconds` - Histogram of append latencies

use crate::types::EntryKind;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Total entries appended
    pub entries_total: IntCounter,

    /// Compensating entries appended
    pub compensations_total: IntCounter,

    /// Postings absorbed as duplicates
    pub duplicates_total: IntCounter,

    /// Append duration histogram
    pub append_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_total", &self.entries_total.get())
            .field("duplicates_total", &self.duplicates_total.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector on a private registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total =
            IntCounter::new("ledger_entries_total", "Total number of entries appended")?;
        registry.register(Box::new(entries_total.clone()))?;

        let compensations_total = IntCounter::new(
            "ledger_compensations_total",
            "Compensating entries appended",
        )?;
        registry.register(Box::new(compensations_total.clone()))?;

        let duplicates_total = IntCounter::new(
            "ledger_duplicates_total",
            "Postings absorbed as duplicates",
        )?;
        registry.register(Box::new(duplicates_total.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_append_duration_seconds",
                "Histogram of append latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        Ok(Self {
            entries_total,
            compensations_total,
            duplicates_total,
            append_duration,
            registry,
        })
    }

    /// Record an appended entry
    pub fn record_entry(&self, kind: EntryKind) {
        self.entries_total.inc();
        if kind == EntryKind::Compensation {
            self.compensations_total.inc();
        }
    }

    /// Record a duplicate posting
    pub fn record_duplicate(&self) {
        self.duplicates_total.inc();
    }

    /// Record append duration
    pub fn record_append_duration(&self, duration_seconds: f64) {
        self.append_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_total.get(), 0);
        assert_eq!(metrics.duplicates_total.get(), 0);
    }

    #[test]
    fn test_record_entry_kinds() {
        let metrics = Metrics::new().unwrap();
        metrics.record_entry(EntryKind::Donation);
        metrics.record_entry(EntryKind::Compensation);
        assert_eq!(metrics.entries_total.get(), 2);
        assert_eq!(metrics.compensations_total.get(), 1);
    }

    #[test]
    fn test_independent_registries() {
        // Each collector owns its registry, so two ledgers in one process don't collide
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_duplicate();
        assert_eq!(b.duplicates_total.get(), 0);
        assert_eq!(a.registry().gather().len(), 4);
    }
}
