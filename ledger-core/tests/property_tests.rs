//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Idempotency: any number of redeliveries yields exactly one positive entry
//! - Net bound: a donation's net is always its amount or zero
//! - Compensation chains: confirm → revert → reconfirm nets to the original
//! - Hash chain: every log verifies after arbitrary interleavings

use chrono::Utc;
use ledger_core::{
    crypto::hash_payload, AppendOutcome, CharityRef, Config, Currency, DonationEvent, DonorRef,
    EntryKind, FinalityState, Ledger, Posting, RailKind,
};
use proptest::prelude::*;
use tempfile::TempDir;

/// Strategy for generating valid amounts (positive minor units)
fn amount_strategy() -> impl Strategy<Value = i64> {
    1i64..10_000_000_000i64
}

/// Strategy for generating rails
fn rail_strategy() -> impl Strategy<Value = RailKind> {
    prop_oneof![
        Just(RailKind::FiatCard),
        Just(RailKind::FiatBank),
        Just(RailKind::Btc),
        Just(RailKind::Eth),
        Just(RailKind::Stablecoin),
    ]
}

/// A rail fact in a confirm/revert sequence
#[derive(Debug, Clone, Copy)]
enum Step {
    Confirm,
    Revert,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::Confirm), Just(Step::Revert)]
}

fn donation(rail_kind: RailKind, external_id: &str, amount: i64, payload: &[u8]) -> DonationEvent {
    DonationEvent {
        external_id: external_id.to_string(),
        rail_kind,
        amount,
        currency: Currency::USD,
        donor_ref: DonorRef::new("donor-1"),
        charity_ref: CharityRef::new("charity-1"),
        observed_at: Utc::now(),
        finality_state: FinalityState::Confirmed,
        raw_payload_hash: hash_payload(payload),
        schedule_id: None,
        message: None,
    }
}

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;

    (Ledger::open(config).await.unwrap(), temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: redelivering the same fact never creates a second positive entry
    #[test]
    fn prop_duplicate_deliveries_post_once(
        amount in amount_strategy(),
        rail in rail_strategy(),
        deliveries in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let event = donation(rail, "fact-1", amount, b"payload");

            let mut fresh = 0;
            for _ in 0..deliveries {
                let reservation = ledger.identities().reserve(rail, "fact-1").unwrap();
                if reservation.is_fresh() {
                    fresh += 1;
                }
                // Every delivery posts; the ledger must absorb the repeats
                ledger
                    .append(Posting::credit(reservation.donation_id(), &event))
                    .await
                    .unwrap();
            }

            let entries = ledger.replay_all().unwrap();
            let positive = entries.iter().filter(|e| e.net_amount > 0).count();
            prop_assert_eq!(fresh, 1);
            prop_assert_eq!(positive, 1);
            prop_assert_eq!(entries[0].net_amount, amount);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: after any confirm/revert sequence the net is amount or zero
    #[test]
    fn prop_net_is_amount_or_zero(
        amount in amount_strategy(),
        steps in prop::collection::vec(step_strategy(), 1..12),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let donation_id = ledger
                .identities()
                .reserve(RailKind::Btc, "txid")
                .unwrap()
                .donation_id();

            let mut confirmed_once = false;
            for (i, step) in steps.iter().enumerate() {
                let event = donation(RailKind::Btc, "txid", amount, format!("p{}", i).as_bytes());
                let result = match step {
                    Step::Confirm => ledger.append(Posting::credit(donation_id, &event)).await,
                    Step::Revert => ledger.append(Posting::compensation(donation_id, &event)).await,
                };

                match (step, confirmed_once) {
                    // Reversal before any confirmation is refused
                    (Step::Revert, false) => prop_assert!(result.is_err()),
                    _ => {
                        result.unwrap();
                    }
                }
                if matches!(step, Step::Confirm) {
                    confirmed_once = true;
                }

                if let Some(balance) = ledger.balance(&donation_id).unwrap() {
                    prop_assert!(balance.net_amount == amount || balance.net_amount == 0);
                }
            }

            prop_assert!(ledger.verify_chain().is_ok());
            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: totals equal the fold of the replayed log
    #[test]
    fn prop_read_total_matches_replay(amounts in prop::collection::vec(amount_strategy(), 1..10)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            for (i, amount) in amounts.iter().enumerate() {
                let id = format!("ch_{}", i);
                let event = donation(RailKind::FiatCard, &id, *amount, id.as_bytes());
                let reservation = ledger.identities().reserve(RailKind::FiatCard, &id).unwrap();
                ledger
                    .append(Posting::credit(reservation.donation_id(), &event))
                    .await
                    .unwrap();
            }

            let replayed: i64 = ledger.replay_all().unwrap().iter().map(|e| e.net_amount).sum();
            let totals = ledger.read_total(&CharityRef::new("charity-1"), Utc::now()).unwrap();
            prop_assert_eq!(totals.get(&Currency::USD).copied(), Some(replayed));
            prop_assert_eq!(replayed, amounts.iter().sum::<i64>());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_confirm_revert_reconfirm_lifecycle() {
        let (ledger, _temp) = create_test_ledger().await;
        let donation_id = ledger
            .identities()
            .reserve(RailKind::Eth, "0xfeed")
            .unwrap()
            .donation_id();

        let kinds = [
            (b"confirm".as_slice(), true, EntryKind::Donation),
            (b"reorg".as_slice(), false, EntryKind::Compensation),
            // Re-inclusion reported with the original payload bytes
            (b"confirm".as_slice(), true, EntryKind::Reconfirmation),
        ];

        for (payload, confirm, expected) in kinds {
            let event = donation(RailKind::Eth, "0xfeed", 2_000_000_000, payload);
            let posting = if confirm {
                Posting::credit(donation_id, &event)
            } else {
                Posting::compensation(donation_id, &event)
            };
            match ledger.append(posting).await.unwrap() {
                AppendOutcome::Appended(entry) => assert_eq!(entry.kind, expected),
                other => panic!("expected an entry, got {:?}", other),
            }
        }

        let history = ledger.donation_entries(&donation_id).unwrap();
        let nets: Vec<i64> = history.iter().map(|e| e.net_amount).collect();
        assert_eq!(nets, vec![2_000_000_000, -2_000_000_000, 2_000_000_000]);
        assert_eq!(ledger.verify_chain().unwrap(), 3);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_preserves_identities_and_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let donation_id = {
            let ledger = Ledger::open(config.clone()).await.unwrap();
            let reservation = ledger.identities().reserve(RailKind::FiatBank, "ach-1").unwrap();
            let event = donation(RailKind::FiatBank, "ach-1", 2500, b"ach-1");
            ledger
                .append(Posting::credit(reservation.donation_id(), &event))
                .await
                .unwrap();
            ledger.shutdown().await.unwrap();
            // Give the writer a moment to release the database
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            reservation.donation_id()
        };

        let ledger = Ledger::open(config).await.unwrap();
        let reservation = ledger.identities().reserve(RailKind::FiatBank, "ach-1").unwrap();
        assert!(!reservation.is_fresh());
        assert_eq!(reservation.donation_id(), donation_id);
        assert_eq!(ledger.head().unwrap(), Some(0));
        assert_eq!(ledger.verify_chain().unwrap(), 1);

        ledger.shutdown().await.unwrap();
    }
}
