//! Configuration for the reconciliation service

use crate::{directory::CharityRecord, finality::FinalityPolicy, Error, Result};
use chrono::Duration;
use ledger_core::RailKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest interval any setting may configure (100 years)
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// Configured seconds as a `Duration`, saturating at `MAX_DURATION_SECS`
pub fn duration_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn check_duration(field: &str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(Error::Config(format!(
            "{} of {}s exceeds the {}s maximum",
            field, secs, MAX_DURATION_SECS
        )));
    }
    Ok(())
}

/// Reconciliation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Service name
    pub service_name: String,

    /// Ledger configuration
    pub ledger: ledger_core::Config,

    /// Finality policy table
    pub finality: FinalityPolicy,

    /// Pending queue and expiry
    pub pending: PendingConfig,

    /// Rail workers
    pub workers: WorkerConfig,

    /// Recurring schedules
    pub schedules: ScheduleConfig,

    /// Charities loaded into the in-memory directory at startup
    pub charities: Vec<CharityRecord>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            service_name: "donation-reconciler".to_string(),
            ledger: ledger_core::Config::default(),
            finality: FinalityPolicy::default(),
            pending: PendingConfig::default(),
            workers: WorkerConfig::default(),
            schedules: ScheduleConfig::default(),
            charities: Vec::new(),
        }
    }
}

/// Pending queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    /// Maximum facts held at once
    pub capacity: usize,

    /// Re-evaluate held facts this often (seconds)
    pub recheck_interval_secs: u64,

    /// Expire facts pending longer than this (seconds)
    pub observation_window_secs: u64,

    /// Keep reverted or expired outcomes queryable this long (seconds)
    pub outcome_retention_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            recheck_interval_secs: 30,
            observation_window_secs: 7 * 24 * 3600, // 7 days
            outcome_retention_secs: 30 * 24 * 3600, // 30 days
        }
    }
}

/// Rail worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Rails served by the binary (one worker each)
    pub rails: Vec<RailKind>,

    /// Idle delay between polls (milliseconds)
    pub poll_interval_ms: u64,

    /// First backoff delay after a transient poll error (milliseconds)
    pub backoff_initial_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rails: RailKind::ALL.to_vec(),
            poll_interval_ms: 500,
            backoff_initial_ms: 200,
            backoff_max_ms: 30_000,
        }
    }
}

/// Recurring schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Failed attempts tolerated per period before the schedule is exhausted
    pub max_charge_retries: u32,

    /// First retry delay (seconds)
    pub retry_base_secs: u64,

    /// Retry delay ceiling (seconds)
    pub retry_max_secs: u64,

    /// Unresolved charges older than this count as failed (seconds)
    pub in_flight_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_charge_retries: 2,
            retry_base_secs: 3600,     // 1 hour
            retry_max_secs: 24 * 3600, // 1 day
            in_flight_timeout_secs: 8 * 24 * 3600, // past the observation window
        }
    }
}

impl ReconcilerConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ReconcilerConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.ledger.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from `RECONCILER_CONFIG` if set, otherwise defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var("RECONCILER_CONFIG") {
            tracing::info!(path = %path, "Loading reconciler config");
            return Self::from_file(path);
        }

        let mut config = ReconcilerConfig::default();
        config.ledger.apply_env();

        if let Ok(capacity) = std::env::var("RECONCILER_PENDING_CAPACITY") {
            config.pending.capacity = capacity
                .parse()
                .map_err(|_| Error::Config(format!("Invalid RECONCILER_PENDING_CAPACITY: {}", capacity)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.finality.validate()?;
        if self.pending.capacity == 0 {
            return Err(Error::Config("pending.capacity must be positive".to_string()));
        }
        if self.pending.recheck_interval_secs == 0 {
            return Err(Error::Config(
                "pending.recheck_interval_secs must be positive".to_string(),
            ));
        }
        check_duration("pending.recheck_interval_secs", self.pending.recheck_interval_secs)?;
        check_duration("pending.observation_window_secs", self.pending.observation_window_secs)?;
        check_duration("pending.outcome_retention_secs", self.pending.outcome_retention_secs)?;
        check_duration("schedules.retry_base_secs", self.schedules.retry_base_secs)?;
        check_duration("schedules.retry_max_secs", self.schedules.retry_max_secs)?;
        check_duration("schedules.in_flight_timeout_secs", self.schedules.in_flight_timeout_secs)?;
        if self.schedules.in_flight_timeout_secs == 0 {
            return Err(Error::Config(
                "schedules.in_flight_timeout_secs must be positive".to_string(),
            ));
        }
        if self.schedules.retry_base_secs > self.schedules.retry_max_secs {
            return Err(Error::Config(
                "schedules.retry_base_secs exceeds retry_max_secs".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finality::FinalityRule;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.schedules.max_charge_retries, 2);
        assert_eq!(config.workers.rails.len(), 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_overrides() {
        let config: ReconcilerConfig = toml::from_str(
            r#"
            service_name = "reconciler-eu"

            [ledger]
            data_dir = "/var/lib/donations"

            [pending]
            capacity = 50

            [finality]
            [[finality.policies]]
            rail = "Eth"
            rule = "confirmations"
            min_confirmations = 20

            [[charities]]
            charity_ref = "clean-water"
            name = "Clean Water Now"
            category = "health"
            verified = true
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.service_name, "reconciler-eu");
        assert_eq!(config.pending.capacity, 50);
        assert_eq!(config.pending.recheck_interval_secs, 30);
        assert_eq!(
            config.finality.rule_for(RailKind::Eth),
            Some(FinalityRule::Confirmations { min_confirmations: 20 })
        );
        assert_eq!(config.finality.rule_for(RailKind::Btc), None);
        assert!(config.charities[0].verified);
    }

    #[test]
    fn test_validate_rejects_inverted_retry_bounds() {
        let mut config = ReconcilerConfig::default();
        config.schedules.retry_base_secs = 10;
        config.schedules.retry_max_secs = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let mut config = ReconcilerConfig::default();
        config.pending.observation_window_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ReconcilerConfig::default();
        config.schedules.retry_max_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ReconcilerConfig::default();
        config.finality.set(
            RailKind::FiatBank,
            FinalityRule::Settlement { settlement_window_secs: u64::MAX },
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ReconcilerConfig::default();
        config.pending.observation_window_secs = MAX_DURATION_SECS;
        config.validate().unwrap();
        assert_eq!(duration_secs(u64::MAX), duration_secs(MAX_DURATION_SECS));
    }
}
