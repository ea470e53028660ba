//! Detection and transferability transitions.

use rust_decimal_macros::dec;
use std::time::Duration;

use sweeper::engine::detector::ScanOutcome;
use sweeper::error::SweepError;
use sweeper::events::EventKind;
use sweeper::storage::SweepStore;
use sweeper::types::ActivityKind;

use crate::{wallet_config, HarnessBuilder, OTHER, TOKEN, WALLET};

fn completed(outcome: ScanOutcome) -> sweeper::engine::detector::ScanReport {
    match outcome {
        ScanOutcome::Completed(report) => report,
        ScanOutcome::Skipped => panic!("scan unexpectedly skipped"),
    }
}

#[tokio::test]
async fn test_locked_token_detected_once() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(500));
    let mut events = h.sink.subscribe_wallet(WALLET);

    let report = completed(h.engine.start_monitoring(WALLET).await.unwrap());
    assert_eq!(report.assets_checked, 1);
    assert_eq!(report.detections_created, 1);
    assert_eq!(report.transitions, 0);

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::TokenDetected);
    assert_eq!(event.payload["asset"], TOKEN);

    // A second scan updates nothing and creates nothing.
    let report = completed(h.engine.scan_wallet(WALLET).await);
    assert_eq!(report.detections_created, 0);
    assert_eq!(report.balances_updated, 0);

    let detections = h.store.list_detections(WALLET).await.unwrap();
    assert_eq!(detections.len(), 1);
    assert!(!detections[0].transferable);
    assert!(h.ledger.submissions().is_empty());
}

#[tokio::test]
async fn test_trading_enabled_triggers_single_auto_sweep() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(500));
    h.engine.start_monitoring(WALLET).await.unwrap();

    h.ledger.set_transferable(TOKEN, true);
    let report = completed(h.engine.scan_wallet(WALLET).await);
    assert_eq!(report.transitions, 1);
    assert_eq!(report.sweeps_triggered, 1);

    let submissions = h.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].to, crate::SAFE);
    assert_eq!(submissions[0].amount, dec!(500));

    // Already transferable: later scans never sweep again.
    let report = completed(h.engine.scan_wallet(WALLET).await);
    assert_eq!(report.transitions, 0);
    assert_eq!(report.sweeps_triggered, 0);
    assert_eq!(h.ledger.submissions().len(), 1);

    let activity = h.store.list_activity(Some(WALLET), 50).await.unwrap();
    assert!(activity
        .iter()
        .any(|r| r.kind == ActivityKind::TransferabilityEnabled));
}

#[tokio::test]
async fn test_auto_sweep_disabled_only_records_transition() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(500));
    h.ledger.set_transferable(TOKEN, true);

    let report = completed(h.engine.start_monitoring(WALLET).await.unwrap());
    assert_eq!(report.detections_created, 1);
    assert_eq!(report.transitions, 1);
    assert_eq!(report.sweeps_triggered, 0);
    assert!(h.ledger.submissions().is_empty());

    let detection = h.store.find_detection(WALLET, TOKEN).await.unwrap().unwrap();
    assert!(detection.transferable);
}

#[tokio::test]
async fn test_transferable_flag_never_reverts() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(5));
    h.ledger.set_transferable(TOKEN, true);
    h.engine.start_monitoring(WALLET).await.unwrap();

    h.ledger.set_transferable(TOKEN, false);
    h.ledger.set_balance(WALLET, TOKEN, dec!(6));
    let report = completed(h.engine.scan_wallet(WALLET).await);
    assert_eq!(report.balances_updated, 1);

    let detection = h.store.find_detection(WALLET, TOKEN).await.unwrap().unwrap();
    assert!(detection.transferable);
    assert_eq!(detection.balance, dec!(6));
}

#[tokio::test]
async fn test_failing_asset_does_not_stop_scan() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN, OTHER])
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.ledger.fail_asset(TOKEN);
    h.ledger.set_balance(WALLET, OTHER, dec!(1));

    let report = completed(h.engine.start_monitoring(WALLET).await.unwrap());
    assert_eq!(report.errors, 1);
    assert_eq!(report.assets_checked, 1);
    assert_eq!(report.detections_created, 1);
    assert!(h.store.find_detection(WALLET, OTHER).await.unwrap().is_some());
}

#[tokio::test]
async fn test_overlapping_scans_are_skipped() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(1));
    h.ledger.set_balance_delay(Duration::from_millis(100));

    let (a, b) = tokio::join!(h.engine.scan_wallet(WALLET), h.engine.scan_wallet(WALLET));
    let skipped = [&a, &b]
        .iter()
        .filter(|o| matches!(o, ScanOutcome::Skipped))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(h.store.list_detections(WALLET).await.unwrap().len(), 1);

    // Once the first scan finishes the wallet can be scanned again.
    assert!(matches!(h.engine.scan_wallet(WALLET).await, ScanOutcome::Completed(_)));
}

#[tokio::test]
async fn test_register_asset_checks_immediately() {
    let h = HarnessBuilder::new()
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.engine.start_monitoring(WALLET).await.unwrap();

    assert!(!h.engine.register_and_probe_asset(WALLET, OTHER).await.unwrap());
    h.ledger.set_balance(WALLET, TOKEN, dec!(42));
    assert!(h.engine.register_and_probe_asset(WALLET, TOKEN).await.unwrap());
    assert_eq!(h.engine.registered_assets(WALLET).await.len(), 2);

    // Registered assets join the regular scan.
    let report = completed(h.engine.scan_wallet(WALLET).await);
    assert_eq!(report.assets_checked, 2);
    assert_eq!(h.store.list_detections(WALLET).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_requires_monitoring() {
    let h = HarnessBuilder::new().build();
    let err = h.engine.register_asset(WALLET, TOKEN).await.unwrap_err();
    assert!(matches!(err, SweepError::NotMonitored(_)));
}

#[tokio::test]
async fn test_registered_transferable_asset_sweeps_when_auto_enabled() {
    for (auto, expected) in [(true, 1), (false, 0)] {
        let h = HarnessBuilder::new()
            .price(TOKEN, dec!(2))
            .build()
            .with_wallet(wallet_config(auto, "standard"))
            .await;
        h.engine.start_monitoring(WALLET).await.unwrap();
        h.ledger.set_balance(WALLET, TOKEN, dec!(100));
        h.ledger.set_transferable(TOKEN, true);

        assert!(h.engine.register_and_probe_asset(WALLET, TOKEN).await.unwrap());
        assert_eq!(h.ledger.submissions().len(), expected, "auto_sweep = {auto}");

        let detection = h.store.find_detection(WALLET, TOKEN).await.unwrap().unwrap();
        assert!(detection.transferable);
        assert_eq!(detection.value_usd, Some(dec!(200)));
    }
}

#[tokio::test]
async fn test_registration_racing_scan_sweeps_once() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(500));
    h.engine.start_monitoring(WALLET).await.unwrap();

    h.ledger.set_transferable(TOKEN, true);
    h.ledger.set_transfer_check_delay(Duration::from_millis(30));
    let (scan, registered) = tokio::join!(
        h.engine.scan_wallet(WALLET),
        h.engine.register_and_probe_asset(WALLET, TOKEN),
    );
    assert!(registered.unwrap());
    assert!(completed(scan).transitions <= 1);
    assert_eq!(h.ledger.submissions().len(), 1);

    let activity = h.store.list_activity(Some(WALLET), 50).await.unwrap();
    let transitions = activity
        .iter()
        .filter(|r| r.kind == ActivityKind::TransferabilityEnabled)
        .count();
    assert_eq!(transitions, 1);
}
