//! End-to-end reconciliation scenarios
//!
//! Rail payloads go in through the real adapters; assertions are made on the
//! ledger, the projector and the schedule engine.

use chrono::{Datelike, Duration, Utc};
use impact_projector::MemorySink;
use ledger_core::{CharityRef, Currency, DonorRef, RailKind};
use rail_adapters::{
    ChainAdapter, FiatAdapter, RailAdapter, RailFeed, ScriptedOutcome, SimulatedProcessor,
};
use reconciliation::{
    Cadence, ChargeAttempt, DonationStatus, InMemoryCharityDirectory, ReconcilerConfig,
    ReconciliationEngine, ReviewReason, ScheduleRequest, ScheduleState,
};
use std::sync::Arc;
use tempfile::TempDir;

const CHARITY: &str = "clean-water";
const DONOR: &str = "donor-1";

async fn create_test_engine() -> (ReconciliationEngine, Arc<MemorySink>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = ReconcilerConfig::default();
    config.ledger.data_dir = temp_dir.path().to_path_buf();
    config.ledger.rocksdb.sync_writes = false;

    let directory = InMemoryCharityDirectory::new();
    let charity = CharityRef::new(CHARITY);
    directory
        .register(charity.clone(), "Clean Water Now", "health", "Wells", 5_000_000)
        .unwrap();
    directory.verify(&charity, Some("IBAN-1".to_string())).unwrap();

    let sink = Arc::new(MemorySink::new());
    let engine = ReconciliationEngine::new(config, Arc::new(directory), sink.clone())
        .await
        .unwrap();
    (engine, sink, temp_dir)
}

fn card_webhook(kind: &str, id: &str, amount: i64) -> String {
    format!(
        r#"{{"type":"{}","id":"{}","amount":{},"currency":"USD","donor":"{}","charity":"{}","occurred_at":"{}"}}"#,
        kind,
        id,
        amount,
        DONOR,
        CHARITY,
        Utc::now().to_rfc3339()
    )
}

fn btc_record(txid: &str, amount: &str, confirmations: u32, status: &str) -> String {
    format!(
        r#"{{"txid":"{}","asset":"BTC","amount":"{}","confirmations":{},"donor":"{}","charity":"{}","status":"{}"}}"#,
        txid, amount, confirmations, DONOR, CHARITY, status
    )
}

fn usd_total(engine: &ReconciliationEngine) -> i64 {
    engine
        .charity_totals(&CharityRef::new(CHARITY), Utc::now())
        .unwrap()
        .get(&Currency::USD)
        .copied()
        .unwrap_or(0)
}

#[tokio::test]
async fn test_fiat_settlement_issues_one_receipt() {
    let (engine, sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    let mut adapter = FiatAdapter::new(feed.clone(), "reconciler").unwrap();

    feed.publish(card_webhook("charge.authorized", "ch_1", 5000));
    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.held, 1);
    assert_eq!(
        engine.donation_status(RailKind::FiatCard, "ch_1").unwrap(),
        DonationStatus::Pending
    );
    assert_eq!(usd_total(&engine), 0);

    feed.publish(card_webhook("charge.settled", "ch_1", 5000));
    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.posted, 1);
    assert!(engine.pending().is_empty());

    let receipts = engine.donor_receipts(&DonorRef::new(DONOR), Utc::now().year());
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].amount, 5000);
    assert_eq!(receipts[0].currency, Currency::USD);
    assert_eq!(receipts[0].supersedes, None);
    assert_eq!(sink.notices().len(), 1);
    assert_eq!(usd_total(&engine), 5000);
    assert_eq!(
        engine.donation_status(RailKind::FiatCard, "ch_1").unwrap(),
        DonationStatus::Confirmed
    );
}

#[tokio::test]
async fn test_duplicate_btc_delivery_is_absorbed() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::Btc);
    let mut adapter = ChainAdapter::new(feed.clone(), "reconciler").unwrap();

    let record = btc_record("9f2c01", "0.015", 6, "included");
    feed.publish(record.clone());
    feed.publish(record);

    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.posted, 1);
    assert_eq!(report.duplicates, 1);

    let totals = engine
        .charity_totals(&CharityRef::new(CHARITY), Utc::now())
        .unwrap();
    assert_eq!(totals.get(&Currency::BTC), Some(&1_500_000));
    assert_eq!(engine.ledger().head().unwrap(), Some(0));
}

#[tokio::test]
async fn test_chargeback_supersedes_receipt() {
    let (engine, sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    let mut adapter = FiatAdapter::new(feed.clone(), "reconciler").unwrap();

    feed.publish(card_webhook("charge.settled", "ch_7", 5000));
    engine.drain(&mut adapter).await.unwrap();
    let original = engine.donor_receipts(&DonorRef::new(DONOR), Utc::now().year());
    assert_eq!(original.len(), 1);

    feed.publish(card_webhook("charge.dispute.lost", "ch_7", 5000));
    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.posted, 1);

    let receipts = engine.donor_receipts(&DonorRef::new(DONOR), Utc::now().year());
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[1].amount, 0);
    assert_eq!(receipts[1].supersedes, Some(original[0].receipt_id));
    assert_eq!(receipts[1].tax_year, original[0].tax_year);
    assert_eq!(sink.notices().len(), 2);

    assert_eq!(usd_total(&engine), 0);
    assert_eq!(
        engine.donation_status(RailKind::FiatCard, "ch_7").unwrap(),
        DonationStatus::Reverted
    );
    assert_eq!(engine.ledger().verify_chain().unwrap(), 2);
}

#[tokio::test]
async fn test_reorg_after_confirmation_compensates() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::Btc);
    let mut adapter = ChainAdapter::new(feed.clone(), "reconciler").unwrap();

    feed.publish(btc_record("aa01", "0.5", 7, "included"));
    feed.publish(btc_record("aa01", "0.5", 0, "reorged"));
    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.posted, 2);

    let totals = engine
        .charity_totals(&CharityRef::new(CHARITY), Utc::now())
        .unwrap();
    assert_eq!(totals.get(&Currency::BTC).copied().unwrap_or(0), 0);
    assert!(engine.review().is_empty());
}

#[tokio::test]
async fn test_compensation_without_confirmation_goes_to_review() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    let mut adapter = FiatAdapter::new(feed.clone(), "reconciler").unwrap();

    feed.publish(card_webhook("charge.refunded", "ch_404", 5000));
    feed.publish(card_webhook("charge.settled", "ch_405", 1200));
    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.reviewed, 1);
    assert_eq!(report.posted, 1);

    let items = engine.review().for_event(RailKind::FiatCard, "ch_404");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].reason, ReviewReason::OutOfOrderCompensation);
    assert_eq!(usd_total(&engine), 1200);
}

#[tokio::test]
async fn test_failing_schedule_exhausts_until_reactivated() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    let processor = Arc::new(SimulatedProcessor::new(feed.clone()));
    processor.script([
        ScriptedOutcome::Decline,
        ScriptedOutcome::Decline,
        ScriptedOutcome::Decline,
    ]);
    engine
        .schedules()
        .register_initiator(RailKind::FiatCard, processor.clone());
    let mut adapter = FiatAdapter::new(feed, "reconciler").unwrap();

    let t0 = Utc::now();
    let schedule = engine
        .schedules()
        .create(ScheduleRequest {
            donor_ref: DonorRef::new(DONOR),
            charity_ref: CharityRef::new(CHARITY),
            amount: 2500,
            currency: Currency::USD,
            rail_kind: RailKind::FiatCard,
            cadence: Cadence::Monthly,
            first_charge_at: t0,
        })
        .unwrap();

    // Three declined charges; the ceiling is two retries
    for day in 0..3 {
        let report = engine.maintain(t0 + Duration::days(day)).await;
        assert_eq!(report.charges.len(), 1, "day {}", day);
        let drained = engine.drain(&mut adapter).await.unwrap();
        assert_eq!(drained.dropped, 1);
    }

    let status = engine.schedule_status(schedule.schedule_id).unwrap();
    assert_eq!(status.state, ScheduleState::Exhausted);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(usd_total(&engine), 0);

    // No silent resume, however much time passes
    for day in [5, 40, 400] {
        let report = engine.maintain(t0 + Duration::days(day)).await;
        assert!(report.charges.is_empty());
    }

    let resumed_at = t0 + Duration::days(400);
    engine
        .schedules()
        .reactivate(schedule.schedule_id, resumed_at)
        .unwrap();
    let report = engine.maintain(resumed_at).await;
    assert!(matches!(
        report.charges.as_slice(),
        [ChargeAttempt::Initiated { attempt: 1, .. }]
    ));
    let drained = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(drained.posted, 1);

    let status = engine.schedule_status(schedule.schedule_id).unwrap();
    assert_eq!(status.state, ScheduleState::Active);
    assert_eq!(status.linked_count, 1);
    assert!(status.last_linked_donation_id.is_some());
    assert!(status.next_charge_at > resumed_at);
    assert_eq!(usd_total(&engine), 2500);
}

#[tokio::test]
async fn test_cancelled_schedule_still_reconciles_in_flight_charge() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    engine.schedules().register_initiator(
        RailKind::FiatCard,
        Arc::new(SimulatedProcessor::new(feed.clone())),
    );
    let mut adapter = FiatAdapter::new(feed, "reconciler").unwrap();

    let t0 = Utc::now();
    let schedule = engine
        .schedules()
        .create(ScheduleRequest {
            donor_ref: DonorRef::new(DONOR),
            charity_ref: CharityRef::new(CHARITY),
            amount: 1000,
            currency: Currency::USD,
            rail_kind: RailKind::FiatCard,
            cadence: Cadence::Weekly,
            first_charge_at: t0,
        })
        .unwrap();

    engine.maintain(t0).await;
    engine.schedules().cancel(schedule.schedule_id).unwrap();

    let drained = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(drained.posted, 1);
    assert_eq!(usd_total(&engine), 1000);

    let status = engine.schedule_status(schedule.schedule_id).unwrap();
    assert_eq!(status.state, ScheduleState::Cancelled);
    assert!(status.last_linked_donation_id.is_some());
    assert_eq!(status.next_charge_at, t0);
    assert_eq!(status.in_flight, None);

    let entries = engine.ledger().replay_all().unwrap();
    assert_eq!(entries[0].schedule_id, Some(schedule.schedule_id));

    // Cancelled stays terminal; nothing further is charged
    let report = engine.maintain(t0 + Duration::days(30)).await;
    assert!(report.charges.is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_acknowledged_cursor() {
    let (engine, _sink, _dir) = create_test_engine().await;
    let feed = RailFeed::new(RailKind::FiatCard);
    feed.publish(card_webhook("charge.settled", "ch_1", 700));

    let mut adapter = FiatAdapter::new(feed.clone(), "reconciler").unwrap();
    engine.drain(&mut adapter).await.unwrap();
    drop(adapter);

    // Fresh engine and adapter over the same ledger and rail
    let ledger = engine.ledger().clone();
    let config = engine.config().clone();
    drop(engine);

    feed.publish(card_webhook("charge.settled", "ch_2", 300));
    let directory = InMemoryCharityDirectory::new();
    directory
        .register(CharityRef::new(CHARITY), "Clean Water Now", "health", "", 0)
        .unwrap();
    directory.verify(&CharityRef::new(CHARITY), None).unwrap();
    let sink = Arc::new(MemorySink::new());
    let engine =
        ReconciliationEngine::with_ledger(ledger, config, Arc::new(directory), sink.clone()).unwrap();

    let mut adapter = FiatAdapter::new(feed, "reconciler").unwrap();
    assert_eq!(adapter.cursor().offset(), 1);

    let report = engine.drain(&mut adapter).await.unwrap();
    assert_eq!(report.messages, 1);
    assert_eq!(usd_total(&engine), 1000);
    // Receipts from before the restart are rebuilt, not re-sent
    assert_eq!(engine.projector().read(|p| p.receipts().len()), 2);
    assert_eq!(sink.notices().len(), 1);
}
