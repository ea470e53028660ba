//! Recurring scans on a paused clock.

use std::time::Duration;

use crate::{wallet_config, Harness, HarnessBuilder, TOKEN, WALLET};

const INTERVAL: Duration = Duration::from_secs(60);

async fn harness() -> Harness {
    HarnessBuilder::new()
        .catalog(&[TOKEN])
        .scan_interval(INTERVAL)
        .build()
        .with_wallet(wallet_config(false, "standard"))
        .await
}

/// Run spawned tasks until the runtime is idle. Moves the clock by 1ms.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn advance(by: Duration) {
    tokio::time::advance(by).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_ticker_scans_every_interval() {
    let h = harness().await;
    h.engine.start_monitoring(WALLET).await.unwrap();
    settle().await;
    assert_eq!(h.ledger.balance_queries(), 1);

    advance(Duration::from_secs(30)).await;
    assert_eq!(h.ledger.balance_queries(), 1);
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.ledger.balance_queries(), 2);

    advance(Duration::from_secs(30)).await;
    assert_eq!(h.ledger.balance_queries(), 2);
    advance(Duration::from_secs(31)).await;
    assert_eq!(h.ledger.balance_queries(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_scan_defers_next_tick() {
    let h = harness().await;
    h.engine.start_monitoring(WALLET).await.unwrap();
    settle().await;
    h.ledger.set_balance_delay(Duration::from_secs(90));

    // t=60: the scheduled scan starts and runs until t=150.
    advance(INTERVAL).await;
    assert_eq!(h.ledger.balance_queries(), 2);

    // No tick at t=120 while that scan is still running.
    advance(Duration::from_secs(60)).await;
    assert_eq!(h.ledger.balance_queries(), 2);

    // The scan ends near t=151 and the interval restarts from there.
    advance(Duration::from_secs(31)).await;
    assert_eq!(h.ledger.balance_queries(), 2);
    advance(Duration::from_secs(50)).await;
    assert_eq!(h.ledger.balance_queries(), 2);
    advance(Duration::from_secs(11)).await;
    assert_eq!(h.ledger.balance_queries(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_no_scan_after_stop() {
    let h = harness().await;
    h.engine.start_monitoring(WALLET).await.unwrap();
    settle().await;
    assert!(h.engine.stop_monitoring(WALLET).await);

    advance(INTERVAL).await;
    advance(INTERVAL * 10).await;
    assert_eq!(h.ledger.balance_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_retires_previous_ticker() {
    let h = harness().await;
    h.engine.start_monitoring(WALLET).await.unwrap();
    settle().await;
    advance(Duration::from_secs(30)).await;

    // The restart re-arms without scanning; the new ticker is due near t=90.
    h.engine.start_monitoring(WALLET).await.unwrap();
    settle().await;
    assert_eq!(h.ledger.balance_queries(), 1);

    // The old ticker wakes at t=60 and retires.
    advance(Duration::from_secs(31)).await;
    assert_eq!(h.ledger.balance_queries(), 1);

    advance(Duration::from_secs(30)).await;
    assert_eq!(h.ledger.balance_queries(), 2);

    // Only one ticker remains, so nothing is due at t=120.
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.ledger.balance_queries(), 2);
    advance(Duration::from_secs(31)).await;
    assert_eq!(h.ledger.balance_queries(), 3);
}
