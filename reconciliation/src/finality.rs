//! Finality Tracker
//!
//! Decides, per rail, whether a rail fact is Confirmed, still Pending, or
//! Reverted. Thresholds live in a policy table loaded from configuration;
//! the only per-rail knowledge here is which rule a rail uses.
//!
//! ```toml
//! [[finality.policies]]
//! rail = "Btc"
//! rule = "confirmations"
//! min_confirmations = 6
//!
//! [[finality.policies]]
//! rail = "FiatCard"
//! rule = "settlement"
//! settlement_window_secs = 0
//! ```

use crate::{
    config::{duration_secs, MAX_DURATION_SECS},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::{DonationEvent, FinalityState, RailKind};
use rail_adapters::RailSignal;
use serde::{Deserialize, Serialize};

/// When a rail's report becomes irreversible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FinalityRule {
    /// Chain inclusion buried under enough blocks
    Confirmations {
        /// Minimum depth (inclusion block counts as 1)
        min_confirmations: u32,
    },
    /// Settlement callback plus a hold window
    Settlement {
        /// Seconds after settlement before the funds count
        settlement_window_secs: u64,
    },
}

/// Rule for one rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailPolicy {
    /// Rail
    pub rail: RailKind,
    /// Rule
    #[serde(flatten)]
    pub rule: FinalityRule,
}

/// Per-rail finality policy table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityPolicy {
    /// One entry per rail
    pub policies: Vec<RailPolicy>,
}

impl Default for FinalityPolicy {
    fn default() -> Self {
        let settlement = FinalityRule::Settlement {
            settlement_window_secs: 0,
        };
        Self {
            policies: vec![
                RailPolicy {
                    rail: RailKind::FiatCard,
                    rule: settlement,
                },
                RailPolicy {
                    rail: RailKind::FiatBank,
                    rule: settlement,
                },
                RailPolicy {
                    rail: RailKind::Btc,
                    rule: FinalityRule::Confirmations { min_confirmations: 6 },
                },
                RailPolicy {
                    rail: RailKind::Eth,
                    rule: FinalityRule::Confirmations { min_confirmations: 12 },
                },
                RailPolicy {
                    rail: RailKind::Stablecoin,
                    rule: FinalityRule::Confirmations { min_confirmations: 12 },
                },
            ],
        }
    }
}

impl FinalityPolicy {
    /// Empty table (every rail unconfigured)
    pub fn empty() -> Self {
        Self { policies: Vec::new() }
    }

    /// Rule for a rail
    pub fn rule_for(&self, rail: RailKind) -> Option<FinalityRule> {
        self.policies.iter().find(|p| p.rail == rail).map(|p| p.rule)
    }

    /// Set (or replace) the rule for a rail
    pub fn set(&mut self, rail: RailKind, rule: FinalityRule) {
        match self.policies.iter_mut().find(|p| p.rail == rail) {
            Some(policy) => policy.rule = rule,
            None => self.policies.push(RailPolicy { rail, rule }),
        }
    }

    /// Reject tables that configure a rail twice or use a rule the rail cannot signal
    pub fn validate(&self) -> Result<()> {
        for (i, policy) in self.policies.iter().enumerate() {
            if self.policies[..i].iter().any(|p| p.rail == policy.rail) {
                return Err(Error::Config(format!(
                    "finality policy for {} configured twice",
                    policy.rail
                )));
            }
            if let FinalityRule::Settlement { settlement_window_secs } = policy.rule {
                if settlement_window_secs > MAX_DURATION_SECS {
                    return Err(Error::Config(format!(
                        "settlement window for {} exceeds {}s",
                        policy.rail, MAX_DURATION_SECS
                    )));
                }
            }
            let chain_rule = matches!(policy.rule, FinalityRule::Confirmations { .. });
            if chain_rule != policy.rail.is_chain() {
                return Err(Error::Config(format!(
                    "rail {} cannot use rule {:?}",
                    policy.rail, policy.rule
                )));
            }
        }
        Ok(())
    }

    /// Classify against the current time
    pub fn classify(&self, event: &DonationEvent, signal: &RailSignal) -> Result<FinalityState> {
        self.classify_at(event, signal, Utc::now())
    }

    /// Classify a rail fact given its signal
    ///
    /// Reversal signals revert regardless of the table. Anything else needs
    /// a rule for the event's rail; a missing rule is an error, never a
    /// silent confirmation.
    pub fn classify_at(
        &self,
        event: &DonationEvent,
        signal: &RailSignal,
        now: DateTime<Utc>,
    ) -> Result<FinalityState> {
        if signal.is_reversal() {
            return Ok(FinalityState::Reverted);
        }

        let rule = self
            .rule_for(event.rail_kind)
            .ok_or(Error::MissingFinalityPolicy(event.rail_kind))?;

        let state = match (rule, signal) {
            (FinalityRule::Confirmations { min_confirmations }, RailSignal::Confirmations { depth }) => {
                if *depth >= min_confirmations {
                    FinalityState::Confirmed
                } else {
                    FinalityState::Pending
                }
            }
            (FinalityRule::Settlement { settlement_window_secs }, RailSignal::Settled { at }) => {
                let settled_at = at.checked_add_signed(duration_secs(settlement_window_secs));
                match settled_at {
                    Some(settled_at) if now >= settled_at => FinalityState::Confirmed,
                    _ => FinalityState::Pending,
                }
            }
            // Authorizations and signals foreign to the rule never confirm
            _ => FinalityState::Pending,
        };

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ledger_core::{CharityRef, Currency, DonorRef};

    fn event(rail_kind: RailKind) -> DonationEvent {
        DonationEvent {
            external_id: "tx-1".to_string(),
            rail_kind,
            amount: 5000,
            currency: Currency::USD,
            donor_ref: DonorRef::new("donor-1"),
            charity_ref: CharityRef::new("charity-1"),
            observed_at: Utc::now(),
            finality_state: FinalityState::Pending,
            raw_payload_hash: [0u8; 32],
            schedule_id: None,
            message: None,
        }
    }

    #[test]
    fn test_btc_needs_six_confirmations() {
        let policy = FinalityPolicy::default();
        let btc = event(RailKind::Btc);

        let shallow = policy
            .classify(&btc, &RailSignal::Confirmations { depth: 5 })
            .unwrap();
        let deep = policy
            .classify(&btc, &RailSignal::Confirmations { depth: 6 })
            .unwrap();

        assert_eq!(shallow, FinalityState::Pending);
        assert_eq!(deep, FinalityState::Confirmed);
    }

    #[test]
    fn test_settlement_window_holds_until_elapsed() {
        let mut policy = FinalityPolicy::default();
        policy.set(
            RailKind::FiatBank,
            FinalityRule::Settlement {
                settlement_window_secs: 3600,
            },
        );
        let settled_at = Utc::now();
        let signal = RailSignal::Settled { at: settled_at };
        let bank = event(RailKind::FiatBank);

        assert_eq!(
            policy.classify_at(&bank, &signal, settled_at + Duration::minutes(30)).unwrap(),
            FinalityState::Pending
        );
        assert_eq!(
            policy.classify_at(&bank, &signal, settled_at + Duration::hours(1)).unwrap(),
            FinalityState::Confirmed
        );
    }

    #[test]
    fn test_settlement_near_the_end_of_time_stays_pending() {
        let mut policy = FinalityPolicy::default();
        policy.set(
            RailKind::FiatBank,
            FinalityRule::Settlement {
                settlement_window_secs: MAX_DURATION_SECS,
            },
        );
        let signal = RailSignal::Settled { at: DateTime::<Utc>::MAX_UTC };
        assert_eq!(
            policy
                .classify_at(&event(RailKind::FiatBank), &signal, DateTime::<Utc>::MAX_UTC)
                .unwrap(),
            FinalityState::Pending
        );
    }

    #[test]
    fn test_authorization_never_confirms() {
        let policy = FinalityPolicy::default();
        assert_eq!(
            policy.classify(&event(RailKind::FiatCard), &RailSignal::Authorized).unwrap(),
            FinalityState::Pending
        );
    }

    #[test]
    fn test_reversals_ignore_policy() {
        let policy = FinalityPolicy::empty();
        for signal in [RailSignal::Chargeback, RailSignal::Reorged, RailSignal::Declined] {
            assert_eq!(
                policy.classify(&event(RailKind::Btc), &signal).unwrap(),
                FinalityState::Reverted
            );
        }
    }

    #[test]
    fn test_missing_policy_is_an_error() {
        let policy = FinalityPolicy::empty();
        let result = policy.classify(&event(RailKind::Eth), &RailSignal::Confirmations { depth: 100 });
        assert!(matches!(result, Err(Error::MissingFinalityPolicy(RailKind::Eth))));
    }

    #[test]
    fn test_policy_table_from_toml() {
        let policy: FinalityPolicy = toml::from_str(
            r#"
            [[policies]]
            rail = "Btc"
            rule = "confirmations"
            min_confirmations = 3

            [[policies]]
            rail = "FiatCard"
            rule = "settlement"
            settlement_window_secs = 86400
            "#,
        )
        .unwrap();

        policy.validate().unwrap();
        assert_eq!(
            policy.rule_for(RailKind::Btc),
            Some(FinalityRule::Confirmations { min_confirmations: 3 })
        );
        assert_eq!(
            policy.rule_for(RailKind::FiatCard),
            Some(FinalityRule::Settlement {
                settlement_window_secs: 86400
            })
        );
        assert_eq!(policy.rule_for(RailKind::Eth), None);
    }

    #[test]
    fn test_validate_rejects_mismatched_rule() {
        let mut policy = FinalityPolicy::empty();
        policy.set(RailKind::FiatCard, FinalityRule::Confirmations { min_confirmations: 1 });
        assert!(matches!(policy.validate(), Err(Error::Config(_))));
    }
}
