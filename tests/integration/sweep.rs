//! Sweep execution, fee selection, and confirmation polling.

use futures::future::join_all;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use sweeper::engine::sweeper::{ConfirmationPoller, PollOutcome, SweepOutcome, SweepRequest};
use sweeper::error::SweepError;
use sweeper::events::EventSink;
use sweeper::storage::SweepStore;
use sweeper::types::{ActivityKind, Receipt, SweepStatus, Urgency};

use crate::mock_ledger::MockLedger;
use crate::{fast_policy, wallet_config, HarnessBuilder, GWEI, SAFE, TOKEN, WALLET};

fn request(amount: rust_decimal::Decimal, urgency: Urgency) -> SweepRequest {
    SweepRequest {
        wallet: WALLET.to_string(),
        asset: TOKEN.to_string(),
        symbol: "MTKN".to_string(),
        name: "Mock Token".to_string(),
        amount,
        urgency,
    }
}

fn submitted(outcome: &SweepOutcome) -> (String, String) {
    match outcome {
        SweepOutcome::Submitted { attempt_id, tx_hash } => (attempt_id.clone(), tx_hash.clone()),
        other => panic!("expected submission, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_sweeps_submit_once() {
    let h = HarnessBuilder::new()
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_submit_delay(Duration::from_millis(100));

    let attempts = (0..5).map(|_| h.executor.sweep(request(dec!(100), Urgency::High)));
    let outcomes: Vec<SweepOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| assert_ok!(r))
        .collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_submitted()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, SweepOutcome::AlreadyInProgress))
            .count(),
        4
    );

    assert_eq!(h.ledger.submissions().len(), 1);
    assert_eq!(h.store.list_transactions(WALLET, None).await.unwrap().len(), 1);
    assert_eq!(h.executor.active_sweep_count(None), 0);
}

#[tokio::test]
async fn test_below_threshold_submits_nothing() {
    let h = HarnessBuilder::new()
        .price(TOKEN, dec!(0.01))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;

    let outcome = h.executor.sweep(request(dec!(100), Urgency::Medium)).await.unwrap();
    match outcome {
        SweepOutcome::BelowThreshold { value_usd, threshold } => {
            assert_eq!(value_usd, dec!(1));
            assert_eq!(threshold, dec!(10));
        }
        other => panic!("expected threshold skip, got {other:?}"),
    }
    assert!(h.ledger.submissions().is_empty());
    assert!(h.store.list_transactions(WALLET, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_price_still_sweeps() {
    let h = HarnessBuilder::new()
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;

    let outcome = h.executor.sweep(request(dec!(3), Urgency::Medium)).await.unwrap();
    assert!(outcome.is_submitted());
    let txs = h.store.list_transactions(WALLET, None).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert!(txs[0].value_usd.is_none());
}

#[tokio::test]
async fn test_fee_price_follows_strategy_urgency_and_congestion() {
    let h = HarnessBuilder::new()
        .base_fee(45 * GWEI)
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "aggressive"))
        .await;

    let (attempt_id, _) = submitted(&h.executor.sweep(request(dec!(100), Urgency::High)).await.unwrap());
    let attempt = h.store.get_transaction(&attempt_id).await.unwrap().unwrap();
    // 45 gwei × 1.30 × 1.50 × 1.10 (high congestion)
    assert_eq!(attempt.fee_price, 96_525_000_000);
    assert_eq!(h.ledger.submissions()[0].fee_price, 96_525_000_000);
    assert_eq!(h.ledger.submissions()[0].to, SAFE);
}

#[tokio::test]
async fn test_sampled_congestion_overrides_fresh_base_fee() {
    let h = HarnessBuilder::new()
        .base_fee(45 * GWEI)
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "aggressive"))
        .await;
    h.fees.sample().await.unwrap();
    h.ledger.set_base_fee(10 * GWEI);

    let (attempt_id, _) = submitted(&h.executor.sweep(request(dec!(100), Urgency::High)).await.unwrap());
    let attempt = h.store.get_transaction(&attempt_id).await.unwrap().unwrap();
    // 10 gwei × 1.30 × 1.50 × 1.10 (last sample was high)
    assert_eq!(attempt.fee_price, 21_450_000_000);
}

#[tokio::test]
async fn test_submission_failure_recorded() {
    let h = HarnessBuilder::new()
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_error("insufficient funds for gas");

    let outcome = h.executor.sweep(request(dec!(100), Urgency::Medium)).await.unwrap();
    let attempt_id = match outcome {
        SweepOutcome::Failed { attempt_id, reason } => {
            assert!(reason.contains("insufficient funds"));
            attempt_id
        }
        other => panic!("expected failure, got {other:?}"),
    };
    let attempt = h.store.get_transaction(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, SweepStatus::Failed);
    assert!(attempt.tx_hash.is_none());

    // The reservation was released, so a retry can go through.
    h.ledger.clear_error();
    let retry = h.executor.sweep(request(dec!(100), Urgency::Medium)).await.unwrap();
    assert!(retry.is_submitted());
}

#[tokio::test]
async fn test_inactive_wallet_rejected() {
    let mut config = wallet_config(true, "standard");
    config.active = false;
    let h = HarnessBuilder::new().build().with_wallet(config).await;

    let err = h.executor.sweep(request(dec!(100), Urgency::Medium)).await.unwrap_err();
    assert!(matches!(err, SweepError::WalletInactive(_)));
    assert!(h.ledger.submissions().is_empty());

    let activity = h.store.list_activity(Some(WALLET), 10).await.unwrap();
    assert_eq!(activity[0].kind, ActivityKind::SweepFailed);
}

#[tokio::test]
async fn test_manual_sweep_of_detected_asset() {
    let h = HarnessBuilder::new()
        .catalog(&[TOKEN])
        .price(TOKEN, dec!(1))
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await;
    h.ledger.set_balance(WALLET, TOKEN, dec!(250));
    h.engine.start_monitoring(WALLET).await.unwrap();

    // Still locked, but a manual sweep is attempted anyway.
    let outcome = h.engine.manual_sweep(WALLET, TOKEN, Urgency::Low).await.unwrap();
    assert!(outcome.is_submitted());
    assert_eq!(h.ledger.submissions()[0].amount, dec!(250));
}

#[tokio::test]
async fn test_confirmation_polling_is_bounded() {
    let h = HarnessBuilder::new()
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    let (attempt_id, tx_hash) =
        submitted(&h.executor.sweep(request(dec!(1), Urgency::Medium)).await.unwrap());

    // A separate ledger so the executor's own background poller doesn't
    // add to the query count.
    let quiet = MockLedger::new(GWEI);
    let store: Arc<dyn SweepStore> = h.store.clone();
    let events: Arc<dyn EventSink> = Arc::new(h.sink.clone());
    let poller = ConfirmationPoller::new(Arc::new(quiet.clone()), store, events, fast_policy(4));

    let outcome = poller.poll(&attempt_id, &tx_hash).await.unwrap();
    assert_eq!(outcome, PollOutcome::Exhausted(4));
    assert_eq!(quiet.receipt_queries(), 4);

    // Status stays as submitted; only the audit log notes the give-up.
    let attempt = h.store.get_transaction(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, SweepStatus::Completed);
    let activity = h.store.list_activity(Some(WALLET), 20).await.unwrap();
    assert!(activity.iter().any(|r| r.kind == ActivityKind::SweepUnconfirmed));
}

#[tokio::test]
async fn test_reverted_receipt_marks_failed() {
    let h = HarnessBuilder::new()
        .policy(fast_policy(2))
        .build()
        .with_wallet(wallet_config(true, "standard"))
        .await;
    h.ledger.set_receipt(
        &format!("0x{:064x}", 1),
        Receipt {
            block_number: 1234,
            gas_used: 51_000,
            success: false,
        },
    );
    let (attempt_id, tx_hash) =
        submitted(&h.executor.sweep(request(dec!(1), Urgency::Medium)).await.unwrap());

    let outcome = h.executor.poller().poll(&attempt_id, &tx_hash).await.unwrap();
    assert!(matches!(outcome, PollOutcome::Confirmed(r) if !r.success));

    let attempt = h.store.get_transaction(&attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, SweepStatus::Failed);
    assert_eq!(attempt.block_number, Some(1234));
    assert_eq!(attempt.error.as_deref(), Some("transaction reverted"));
}
