//! Sweep executor.
//!
//! Moves a detected balance to the wallet's safe address. At most one
//! attempt per (wallet, asset) runs at a time; the reservation is held by
//! an RAII guard so it is released on every exit path. Successful
//! submissions are handed to a detached [`ConfirmationPoller`].

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConfirmationConfig;
use crate::engine::fees::FeeOptimizer;
use crate::error::{SweepError, SweepResult};
use crate::events::{EventKind, EventSink};
use crate::ledger::{Keyring, LedgerClient};
use crate::pricing::{fiat_value, PriceSource};
use crate::storage::SweepStore;
use crate::types::{
    normalize_id, ActivityKind, ActivityRecord, AssetDetection, FeeStrategy, Receipt,
    SweepAttempt, SweepStatus, Urgency, WalletConfig,
};

// ---------------------------------------------------------------------------
// Sweep locks
// ---------------------------------------------------------------------------

type LockKey = (String, String);

#[derive(Default)]
struct LockState {
    held: HashMap<LockKey, u64>,
    next_token: u64,
}

/// Process-local set of (wallet, asset) pairs with an attempt in flight.
#[derive(Default)]
pub struct SweepLocks {
    state: Mutex<LockState>,
}

impl SweepLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // A panic while holding the lock leaves the map consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically reserve `(wallet, asset)`. `None` if already held.
    pub fn try_acquire(self: &Arc<Self>, wallet: &str, asset: &str) -> Option<SweepGuard> {
        let key = (wallet.to_string(), asset.to_string());
        let mut state = self.state();
        if state.held.contains_key(&key) {
            return None;
        }
        state.next_token += 1;
        let token = state.next_token;
        state.held.insert(key.clone(), token);
        Some(SweepGuard {
            locks: Arc::clone(self),
            key,
            token,
        })
    }

    /// Drop reservations for one wallet or all of them.
    pub fn clear(&self, wallet: Option<&str>) -> usize {
        let mut state = self.state();
        let before = state.held.len();
        match wallet {
            Some(w) => state.held.retain(|(held_wallet, _), _| held_wallet != w),
            None => state.held.clear(),
        }
        before - state.held.len()
    }

    pub fn count(&self, wallet: Option<&str>) -> usize {
        let state = self.state();
        match wallet {
            Some(w) => state.held.keys().filter(|(held, _)| held == w).count(),
            None => state.held.len(),
        }
    }

    fn release(&self, key: &LockKey, token: u64) {
        let mut state = self.state();
        // Only the current holder may release; a guard that outlived an
        // emergency stop must not free a newer reservation.
        if state.held.get(key) == Some(&token) {
            state.held.remove(key);
        }
    }
}

/// Reservation released on drop.
pub struct SweepGuard {
    locks: Arc<SweepLocks>,
    key: LockKey,
    token: u64,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key, self.token);
    }
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SweepRequest {
    pub wallet: String,
    pub asset: String,
    pub symbol: String,
    pub name: String,
    pub amount: Decimal,
    pub urgency: Urgency,
}

impl SweepRequest {
    pub fn from_detection(detection: &AssetDetection, urgency: Urgency) -> Self {
        Self {
            wallet: detection.wallet.clone(),
            asset: detection.asset.clone(),
            symbol: detection.symbol.clone(),
            name: detection.name.clone(),
            amount: detection.balance,
            urgency,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Another attempt holds the (wallet, asset) reservation.
    AlreadyInProgress,
    /// Value known and under the wallet's threshold. Nothing recorded.
    BelowThreshold { value_usd: Decimal, threshold: Decimal },
    Submitted { attempt_id: String, tx_hash: String },
    /// Submission rejected; the attempt is recorded as failed.
    Failed { attempt_id: String, reason: String },
}

impl SweepOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, SweepOutcome::Submitted { .. })
    }
}

// ---------------------------------------------------------------------------
// Confirmation polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&ConfirmationConfig> for ConfirmationPolicy {
    fn from(config: &ConfirmationConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.interval_secs),
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::from(&ConfirmationConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed(Receipt),
    /// Gave up after this many receipt queries.
    Exhausted(u32),
}

/// Polls for a transaction receipt and records the final status.
#[derive(Clone)]
pub struct ConfirmationPoller {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn SweepStore>,
    events: Arc<dyn EventSink>,
    policy: ConfirmationPolicy,
}

impl ConfirmationPoller {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn SweepStore>,
        events: Arc<dyn EventSink>,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            ledger,
            store,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        self.policy
    }

    /// Poll in the background.
    pub fn spawn(&self, attempt_id: String, tx_hash: String) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = poller.poll(&attempt_id, &tx_hash).await {
                warn!(attempt_id = %attempt_id, tx_hash = %tx_hash, error = %e, "Confirmation polling failed");
            }
        })
    }

    /// Query the receipt until it appears or the attempt budget runs out.
    /// Query errors consume an attempt.
    pub async fn poll(&self, attempt_id: &str, tx_hash: &str) -> anyhow::Result<PollOutcome> {
        tokio::time::sleep(self.policy.initial_delay).await;

        for attempt in 1..=self.policy.max_attempts {
            match self.ledger.get_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    self.record_receipt(attempt_id, tx_hash, receipt).await?;
                    return Ok(PollOutcome::Confirmed(receipt));
                }
                Ok(None) => debug!(tx_hash, attempt, "Receipt not yet available"),
                Err(e) => warn!(tx_hash, attempt, error = %e, "Receipt query failed"),
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        self.record_unconfirmed(attempt_id, tx_hash).await?;
        Ok(PollOutcome::Exhausted(self.policy.max_attempts))
    }

    async fn record_receipt(
        &self,
        attempt_id: &str,
        tx_hash: &str,
        receipt: Receipt,
    ) -> anyhow::Result<()> {
        let mut attempt = self
            .store
            .get_transaction(attempt_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Transaction {attempt_id} vanished"))?;

        attempt.tx_hash = Some(tx_hash.to_string());
        attempt.block_number = Some(receipt.block_number);
        attempt.gas_used = Some(receipt.gas_used);
        attempt.completed_at = Some(Utc::now());
        if receipt.success {
            attempt.status = SweepStatus::Completed;
        } else {
            attempt.status = SweepStatus::Failed;
            attempt.error = Some("transaction reverted".to_string());
        }
        self.store.update_transaction(&attempt).await?;

        let payload = json!({
            "transaction_id": attempt.id,
            "tx_hash": tx_hash,
            "asset": attempt.asset,
            "symbol": attempt.symbol,
            "block_number": receipt.block_number,
            "gas_used": receipt.gas_used,
            "success": receipt.success,
        });

        if receipt.success {
            info!(
                wallet = %attempt.wallet,
                tx_hash,
                block = receipt.block_number,
                "Sweep confirmed"
            );
            let message = format!(
                "Sweep of {} {} confirmed in block {}",
                attempt.amount, attempt.symbol, receipt.block_number
            );
            append(&*self.store, &attempt.wallet, Some(&attempt.asset), ActivityKind::SweepConfirmed, message).await;
            self.events
                .publish(EventKind::TransferConfirmed, payload, Some(&attempt.wallet));
        } else {
            warn!(wallet = %attempt.wallet, tx_hash, "Sweep reverted on-chain");
            let message = format!(
                "Sweep of {} {} reverted in block {}",
                attempt.amount, attempt.symbol, receipt.block_number
            );
            append(&*self.store, &attempt.wallet, Some(&attempt.asset), ActivityKind::SweepFailed, message).await;
            self.events
                .publish(EventKind::TransferFailed, payload, Some(&attempt.wallet));
        }
        Ok(())
    }

    async fn record_unconfirmed(&self, attempt_id: &str, tx_hash: &str) -> anyhow::Result<()> {
        let attempt = self
            .store
            .get_transaction(attempt_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Transaction {attempt_id} vanished"))?;

        warn!(
            wallet = %attempt.wallet,
            tx_hash,
            attempts = self.policy.max_attempts,
            "Sweep unconfirmed, giving up on polling"
        );
        let message = format!(
            "No receipt for {tx_hash} after {} checks; status left as {}",
            self.policy.max_attempts, attempt.status
        );
        append(&*self.store, &attempt.wallet, Some(&attempt.asset), ActivityKind::SweepUnconfirmed, message).await;
        self.events.publish(
            EventKind::TransferUnconfirmed,
            json!({
                "transaction_id": attempt.id,
                "tx_hash": tx_hash,
                "status": attempt.status,
            }),
            Some(&attempt.wallet),
        );
        Ok(())
    }
}

/// Audit writes never fail the operation that produced them.
async fn append(
    store: &dyn SweepStore,
    wallet: &str,
    asset: Option<&str>,
    kind: ActivityKind,
    message: String,
) {
    let record = ActivityRecord::new(wallet, asset, kind, message);
    if let Err(e) = store.append_activity(&record).await {
        warn!(wallet, kind = %kind, error = %e, "Failed to append activity");
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct SweepExecutor {
    store: Arc<dyn SweepStore>,
    ledger: Arc<dyn LedgerClient>,
    fees: Arc<FeeOptimizer>,
    prices: Arc<dyn PriceSource>,
    events: Arc<dyn EventSink>,
    keyring: Arc<dyn Keyring>,
    locks: Arc<SweepLocks>,
    poller: ConfirmationPoller,
}

impl SweepExecutor {
    pub fn new(
        store: Arc<dyn SweepStore>,
        ledger: Arc<dyn LedgerClient>,
        fees: Arc<FeeOptimizer>,
        prices: Arc<dyn PriceSource>,
        events: Arc<dyn EventSink>,
        keyring: Arc<dyn Keyring>,
        policy: ConfirmationPolicy,
    ) -> Self {
        let poller = ConfirmationPoller::new(ledger.clone(), store.clone(), events.clone(), policy);
        Self {
            store,
            ledger,
            fees,
            prices,
            events,
            keyring,
            locks: Arc::new(SweepLocks::new()),
            poller,
        }
    }

    pub fn poller(&self) -> &ConfirmationPoller {
        &self.poller
    }

    /// Attempt to move `request.amount` to the wallet's safe address.
    ///
    /// Configuration problems are returned as errors (after being recorded
    /// as a failed activity); a rejected submission is a recorded
    /// [`SweepOutcome::Failed`].
    pub async fn sweep(&self, request: SweepRequest) -> SweepResult<SweepOutcome> {
        let wallet = normalize_id(&request.wallet)
            .ok_or_else(|| SweepError::WalletNotFound(request.wallet.clone()))?;
        let asset = normalize_id(&request.asset)
            .ok_or_else(|| SweepError::InvalidAsset(request.asset.clone()))?;

        let Some(_guard) = self.locks.try_acquire(&wallet, &asset) else {
            info!(wallet = %wallet, asset = %asset, "Sweep already in progress");
            return Ok(SweepOutcome::AlreadyInProgress);
        };

        let config = match self.load_config(&wallet).await {
            Ok(config) => config,
            Err(e) => return Err(self.reject(&wallet, &asset, &request, e).await),
        };
        let strategy = match FeeStrategy::from_str(&config.fee_strategy) {
            Ok(s) => s,
            Err(e) => {
                let err = SweepError::InvalidConfig {
                    wallet: wallet.clone(),
                    reason: e.to_string(),
                };
                return Err(self.reject(&wallet, &asset, &request, err).await);
            }
        };
        let credentials = match self.keyring.credentials(&config) {
            Ok(c) => c,
            Err(e) => {
                let err = SweepError::InvalidConfig {
                    wallet: wallet.clone(),
                    reason: format!("{e:#}"),
                };
                return Err(self.reject(&wallet, &asset, &request, err).await);
            }
        };

        // Unknown price: the threshold can't be evaluated, so proceed.
        let price = match self.prices.asset_usd(&asset).await {
            Ok(price) => price,
            Err(e) => {
                warn!(asset = %asset, error = %e, "Price lookup failed");
                None
            }
        };
        let value_usd = fiat_value(request.amount, price);
        match value_usd {
            Some(value) if value < config.min_transfer_usd => {
                info!(
                    wallet = %wallet,
                    asset = %asset,
                    value = %value,
                    threshold = %config.min_transfer_usd,
                    "Below transfer threshold, skipping"
                );
                return Ok(SweepOutcome::BelowThreshold {
                    value_usd: value,
                    threshold: config.min_transfer_usd,
                });
            }
            Some(_) => {}
            None => warn!(asset = %asset, "No price for asset, threshold not applied"),
        }

        let fee_price = match self.fees.fee_price(strategy, request.urgency).await {
            Ok(price) => price,
            Err(e) => return Err(self.reject(&wallet, &asset, &request, SweepError::Fee(e)).await),
        };

        let mut attempt = SweepAttempt::pending(
            &wallet,
            &asset,
            &request.symbol,
            request.amount,
            value_usd,
            fee_price,
        );
        self.store
            .create_transaction(&attempt)
            .await
            .map_err(SweepError::Store)?;

        info!(
            wallet = %wallet,
            asset = %asset,
            amount = %request.amount,
            symbol = %request.symbol,
            urgency = %request.urgency,
            fee_price = %fee_price,
            "Sweep started"
        );
        append(
            &*self.store,
            &wallet,
            Some(&asset),
            ActivityKind::SweepStarted,
            format!(
                "Sweeping {} {} to {} ({} urgency)",
                request.amount, request.symbol, config.safe_address, request.urgency
            ),
        )
        .await;
        self.events.publish(
            EventKind::TransferStarted,
            json!({
                "transaction_id": attempt.id,
                "asset": asset,
                "symbol": request.symbol,
                "amount": request.amount,
                "fee_price": fee_price.to_string(),
                "urgency": request.urgency,
            }),
            Some(&wallet),
        );

        let submitted = self
            .ledger
            .submit_transfer(
                &credentials,
                &asset,
                &config.safe_address,
                request.amount,
                fee_price,
            )
            .await;

        attempt.completed_at = Some(Utc::now());
        match submitted {
            Ok(tx_hash) => {
                attempt.status = SweepStatus::Completed;
                attempt.tx_hash = Some(tx_hash.clone());
                // The transfer is already broadcast; a store failure must not
                // lose the hash or skip confirmation.
                let persisted = match self.store.update_transaction(&attempt).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            wallet = %wallet,
                            attempt_id = %attempt.id,
                            tx_hash = %tx_hash,
                            error = %e,
                            "Failed to record submitted sweep"
                        );
                        false
                    }
                };

                info!(wallet = %wallet, asset = %asset, tx_hash = %tx_hash, "Sweep submitted");
                append(
                    &*self.store,
                    &wallet,
                    Some(&asset),
                    ActivityKind::SweepCompleted,
                    format!(
                        "Swept {} {} in {}{}",
                        request.amount,
                        request.symbol,
                        tx_hash,
                        if persisted { "" } else { " (record not updated)" }
                    ),
                )
                .await;
                self.events.publish(
                    EventKind::TransferCompleted,
                    json!({
                        "transaction_id": attempt.id,
                        "asset": asset,
                        "symbol": request.symbol,
                        "amount": request.amount,
                        "tx_hash": tx_hash,
                        "persisted": persisted,
                    }),
                    Some(&wallet),
                );

                self.poller.spawn(attempt.id.clone(), tx_hash.clone());
                Ok(SweepOutcome::Submitted {
                    attempt_id: attempt.id,
                    tx_hash,
                })
            }
            Err(e) => {
                let reason = format!("{e:#}");
                attempt.status = SweepStatus::Failed;
                attempt.error = Some(reason.clone());
                let persisted = match self.store.update_transaction(&attempt).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            wallet = %wallet,
                            attempt_id = %attempt.id,
                            error = %e,
                            "Failed to record sweep failure"
                        );
                        false
                    }
                };

                warn!(wallet = %wallet, asset = %asset, error = %reason, "Sweep submission failed");
                append(
                    &*self.store,
                    &wallet,
                    Some(&asset),
                    ActivityKind::SweepFailed,
                    format!("Sweep of {} {} failed: {reason}", request.amount, request.symbol),
                )
                .await;
                self.events.publish(
                    EventKind::TransferFailed,
                    json!({
                        "transaction_id": attempt.id,
                        "asset": asset,
                        "symbol": request.symbol,
                        "error": reason,
                        "persisted": persisted,
                    }),
                    Some(&wallet),
                );

                Ok(SweepOutcome::Failed {
                    attempt_id: attempt.id,
                    reason,
                })
            }
        }
    }

    /// Clear reservations for one wallet or all. Running attempts are not
    /// interrupted; only future acquisition is affected.
    pub fn emergency_stop(&self, wallet: Option<&str>) -> usize {
        let wallet = wallet.and_then(normalize_id);
        let cleared = self.locks.clear(wallet.as_deref());
        warn!(wallet = ?wallet, cleared, "Emergency stop");
        cleared
    }

    pub fn active_sweep_count(&self, wallet: Option<&str>) -> usize {
        let wallet = wallet.and_then(normalize_id);
        self.locks.count(wallet.as_deref())
    }

    async fn load_config(&self, wallet: &str) -> SweepResult<WalletConfig> {
        let config = self
            .store
            .get_wallet(wallet)
            .await
            .map_err(SweepError::Store)?
            .ok_or_else(|| SweepError::WalletNotFound(wallet.to_string()))?;
        if !config.active {
            return Err(SweepError::WalletInactive(wallet.to_string()));
        }
        Ok(config)
    }

    /// Record a sweep that failed before anything was submitted.
    async fn reject(
        &self,
        wallet: &str,
        asset: &str,
        request: &SweepRequest,
        error: SweepError,
    ) -> SweepError {
        warn!(wallet, asset, error = %error, "Sweep rejected");
        append(
            &*self.store,
            wallet,
            Some(asset),
            ActivityKind::SweepFailed,
            format!("Sweep of {} {} rejected: {error}", request.amount, request.symbol),
        )
        .await;
        self.events.publish(
            EventKind::TransferFailed,
            json!({ "asset": asset, "symbol": request.symbol, "error": error.to_string() }),
            Some(wallet),
        );
        error
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
