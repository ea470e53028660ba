//! Detection engine.
//!
//! Each watched wallet gets a ticker task that emits a [`ScanDue`] event on
//! a fixed interval. The dispatcher consumes those events and runs
//! [`DetectionEngine::scan_wallet`], which walks the catalog plus the
//! wallet's registered assets one at a time and drives the per-asset
//! trading-status state machine:
//!
//! ```text
//! balance 0 ──skip
//! balance > 0, no detection ──► detected (locked)
//! detected (locked) ──is_transferable──► transferable ──► auto sweep
//! transferable ──► bookkeeping only
//! ```
//!
//! A ticker is not re-armed until the scan it requested has finished, and
//! a direct `scan_wallet` call for a wallet already being scanned returns
//! [`ScanOutcome::Skipped`].

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::sweeper::{SweepExecutor, SweepOutcome, SweepRequest};
use crate::error::{SweepError, SweepResult};
use crate::events::{EventKind, EventSink};
use crate::ledger::LedgerClient;
use crate::pricing::{fiat_value, PriceSource};
use crate::storage::SweepStore;
use crate::types::{
    normalize_id, ActivityKind, ActivityRecord, AssetDetection, AssetMetadata, KnownAsset,
    Urgency,
};

const SCAN_QUEUE: usize = 256;

// ---------------------------------------------------------------------------
// Scheduler events & reports
// ---------------------------------------------------------------------------

/// Emitted by a wallet's ticker when its interval elapses.
#[derive(Debug)]
pub struct ScanDue {
    pub wallet: String,
    pub generation: u64,
    /// Signalled once the scan has finished; the ticker waits on it.
    pub done: oneshot::Sender<()>,
}

/// Counters for one wallet scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub wallet: String,
    pub assets_checked: usize,
    pub detections_created: usize,
    pub balances_updated: usize,
    pub transitions: usize,
    pub sweeps_triggered: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// No scan ran: one for the same wallet was already in flight, or the
    /// wallet was already monitored.
    Skipped,
}

impl ScanOutcome {
    pub fn report(&self) -> Option<&ScanReport> {
        match self {
            ScanOutcome::Completed(report) => Some(report),
            ScanOutcome::Skipped => None,
        }
    }
}

struct WatchedWallet {
    assets: BTreeSet<String>,
    generation: u64,
}

/// Removes a wallet from the in-flight set on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    wallet: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.wallet);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DetectionEngine {
    store: Arc<dyn SweepStore>,
    ledger: Arc<dyn LedgerClient>,
    prices: Arc<dyn PriceSource>,
    events: Arc<dyn EventSink>,
    executor: Arc<SweepExecutor>,
    catalog: Vec<String>,
    scan_interval: Duration,
    wallets: RwLock<HashMap<String, WatchedWallet>>,
    in_flight: Mutex<HashSet<String>>,
    generation: AtomicU64,
    scan_tx: mpsc::Sender<ScanDue>,
}

impl DetectionEngine {
    /// Build the engine. The returned receiver carries scan-due events and
    /// must be handed to [`spawn_dispatcher`](Self::spawn_dispatcher).
    pub fn new(
        store: Arc<dyn SweepStore>,
        ledger: Arc<dyn LedgerClient>,
        prices: Arc<dyn PriceSource>,
        events: Arc<dyn EventSink>,
        executor: Arc<SweepExecutor>,
        catalog: &[KnownAsset],
        scan_interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ScanDue>) {
        let mut seen = HashSet::new();
        let catalog = catalog
            .iter()
            .filter_map(|a| normalize_id(&a.address))
            .filter(|a| seen.insert(a.clone()))
            .collect();
        let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE);

        let engine = Arc::new(Self {
            store,
            ledger,
            prices,
            events,
            executor,
            catalog,
            scan_interval,
            wallets: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            scan_tx,
        });
        (engine, scan_rx)
    }

    pub fn executor(&self) -> &Arc<SweepExecutor> {
        &self.executor
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    // -- Dispatch ----------------------------------------------------------

    /// Consume scan-due events until every sender is gone. Scans for
    /// different wallets run concurrently.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::Receiver<ScanDue>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(due) = rx.recv().await {
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if engine.is_current(&due.wallet, due.generation).await {
                        match engine.scan_wallet(&due.wallet).await {
                            ScanOutcome::Completed(report) => debug!(
                                wallet = %report.wallet,
                                checked = report.assets_checked,
                                errors = report.errors,
                                "Scheduled scan finished"
                            ),
                            ScanOutcome::Skipped => {
                                debug!(wallet = %due.wallet, "Scheduled scan skipped, one in flight")
                            }
                        }
                    }
                    let _ = due.done.send(());
                });
            }
            debug!("Scan dispatcher stopped");
        })
    }

    fn spawn_ticker(self: &Arc<Self>, wallet: String, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let tx = self.scan_tx.clone();
        let interval = self.scan_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if !engine.is_current(&wallet, generation).await {
                    break;
                }
                drop(engine);

                let (done, finished) = oneshot::channel();
                let due = ScanDue {
                    wallet: wallet.clone(),
                    generation,
                    done,
                };
                if tx.send(due).await.is_err() {
                    break;
                }
                // Not re-armed until the scan completes.
                let _ = finished.await;
            }
            debug!(wallet = %wallet, generation, "Ticker retired");
        });
    }

    async fn is_current(&self, wallet: &str, generation: u64) -> bool {
        self.wallets
            .read()
            .await
            .get(wallet)
            .map_or(false, |w| w.generation == generation)
    }

    // -- Monitoring lifecycle ---------------------------------------------

    /// Watch `wallet`: scan once now, then every scan interval. Calling it
    /// again for a watched wallet only restarts the interval and returns
    /// [`ScanOutcome::Skipped`]; registered assets are kept.
    pub async fn start_monitoring(self: &Arc<Self>, wallet: &str) -> SweepResult<ScanOutcome> {
        let wallet =
            normalize_id(wallet).ok_or_else(|| SweepError::WalletNotFound(wallet.to_string()))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let restarted = {
            let mut wallets = self.wallets.write().await;
            match wallets.get_mut(&wallet) {
                Some(watched) => {
                    watched.generation = generation;
                    true
                }
                None => {
                    wallets.insert(
                        wallet.clone(),
                        WatchedWallet {
                            assets: BTreeSet::new(),
                            generation,
                        },
                    );
                    false
                }
            }
        };

        if restarted {
            info!(wallet = %wallet, generation, "Monitoring interval restarted");
            self.spawn_ticker(wallet, generation);
            return Ok(ScanOutcome::Skipped);
        }
        info!(
            wallet = %wallet,
            interval_secs = self.scan_interval.as_secs(),
            "Monitoring started"
        );

        let outcome = self.scan_wallet(&wallet).await;
        self.spawn_ticker(wallet, generation);
        Ok(outcome)
    }

    /// Stop watching `wallet`. In-flight scans complete; the ticker retires
    /// on its next wake-up.
    pub async fn stop_monitoring(&self, wallet: &str) -> bool {
        let Some(wallet) = normalize_id(wallet) else {
            return false;
        };
        let removed = self.wallets.write().await.remove(&wallet).is_some();
        if removed {
            info!(wallet = %wallet, "Monitoring stopped");
        }
        removed
    }

    pub async fn monitored_wallets(&self) -> Vec<String> {
        let mut wallets: Vec<_> = self.wallets.read().await.keys().cloned().collect();
        wallets.sort();
        wallets
    }

    pub async fn is_monitored(&self, wallet: &str) -> bool {
        match normalize_id(wallet) {
            Some(w) => self.wallets.read().await.contains_key(&w),
            None => false,
        }
    }

    /// Stop monitoring every wallet so all tickers retire.
    pub async fn shutdown(&self) {
        let mut wallets = self.wallets.write().await;
        let count = wallets.len();
        wallets.clear();
        info!(wallets = count, "Detection engine shut down");
    }

    // -- Asset registration -----------------------------------------------

    /// Add an asset to the wallet's watch-list. Returns false when it was
    /// already registered.
    pub async fn register_asset(&self, wallet: &str, asset: &str) -> SweepResult<bool> {
        let (wallet, asset) = normalize_pair(wallet, asset)?;
        let mut wallets = self.wallets.write().await;
        let watched = wallets
            .get_mut(&wallet)
            .ok_or_else(|| SweepError::NotMonitored(wallet.clone()))?;
        let added = watched.assets.insert(asset.clone());
        if added {
            info!(wallet = %wallet, asset = %asset, "Asset registered");
        }
        Ok(added)
    }

    /// Remove an asset from the watch-list. Detection history is kept.
    pub async fn deregister_asset(&self, wallet: &str, asset: &str) -> SweepResult<bool> {
        let (wallet, asset) = normalize_pair(wallet, asset)?;
        let mut wallets = self.wallets.write().await;
        let watched = wallets
            .get_mut(&wallet)
            .ok_or_else(|| SweepError::NotMonitored(wallet.clone()))?;
        let removed = watched.assets.remove(&asset);
        if removed {
            info!(wallet = %wallet, asset = %asset, "Asset deregistered");
        }
        Ok(removed)
    }

    pub async fn registered_assets(&self, wallet: &str) -> Vec<String> {
        let Some(wallet) = normalize_id(wallet) else {
            return Vec::new();
        };
        self.wallets
            .read()
            .await
            .get(&wallet)
            .map(|w| w.assets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `asset` and scan it immediately. Returns whether a positive
    /// balance was found.
    pub async fn register_and_probe_asset(&self, wallet: &str, asset: &str) -> SweepResult<bool> {
        self.register_asset(wallet, asset).await?;
        let (wallet, asset) = normalize_pair(wallet, asset)?;
        let mut report = ScanReport {
            wallet: wallet.clone(),
            ..ScanReport::default()
        };
        self.scan_asset(&wallet, &asset, &mut report)
            .await
            .map_err(SweepError::Ledger)
    }

    /// Sweep a detected asset now, whatever its transferability state.
    pub async fn manual_sweep(
        &self,
        wallet: &str,
        asset: &str,
        urgency: Urgency,
    ) -> SweepResult<SweepOutcome> {
        let (wallet, asset) = normalize_pair(wallet, asset)?;
        let detection = self
            .store
            .find_detection(&wallet, &asset)
            .await
            .map_err(SweepError::Store)?
            .ok_or_else(|| SweepError::NotDetected {
                wallet: wallet.clone(),
                asset: asset.clone(),
            })?;
        info!(wallet = %wallet, asset = %asset, urgency = %urgency, "Manual sweep requested");
        self.executor
            .sweep(SweepRequest::from_detection(&detection, urgency))
            .await
    }

    // -- Scanning ------------------------------------------------------------

    /// Scan every catalog and registered asset of `wallet` in turn. A
    /// failure on one asset is counted and does not stop the others.
    pub async fn scan_wallet(&self, wallet: &str) -> ScanOutcome {
        let Some(wallet) = normalize_id(wallet) else {
            return ScanOutcome::Completed(ScanReport::default());
        };
        let Some(_in_flight) = self.enter_scan(&wallet) else {
            return ScanOutcome::Skipped;
        };

        let mut assets: Vec<String> = self.catalog.clone();
        if let Some(watched) = self.wallets.read().await.get(&wallet) {
            assets.extend(
                watched
                    .assets
                    .iter()
                    .filter(|a| !self.catalog.contains(a))
                    .cloned(),
            );
        }

        let mut report = ScanReport {
            wallet: wallet.clone(),
            ..ScanReport::default()
        };
        for asset in &assets {
            if let Err(e) = self.scan_asset(&wallet, asset, &mut report).await {
                report.errors += 1;
                warn!(wallet = %wallet, asset = %asset, error = %e, "Asset scan failed");
            }
        }

        debug!(
            wallet = %wallet,
            checked = report.assets_checked,
            created = report.detections_created,
            transitions = report.transitions,
            "Wallet scan complete"
        );
        ScanOutcome::Completed(report)
    }

    fn enter_scan(&self, wallet: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(wallet.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            wallet: wallet.to_string(),
        })
    }

    /// Per-asset step. Returns whether the wallet holds a positive balance.
    async fn scan_asset(&self, wallet: &str, asset: &str, report: &mut ScanReport) -> Result<bool> {
        let balance = self.ledger.get_balance(wallet, asset).await?;
        report.assets_checked += 1;
        if balance <= Decimal::ZERO {
            return Ok(false);
        }

        let value_usd = fiat_value(balance, self.price(asset).await);
        let mut detection = match self.store.find_detection(wallet, asset).await? {
            Some(mut existing) => {
                if existing.balance != balance {
                    existing.balance = balance;
                    existing.value_usd = value_usd;
                    report.balances_updated += 1;
                }
                existing.last_checked = Utc::now();
                self.store.update_detection(&existing).await?;
                existing
            }
            None => match self.record_detection(wallet, asset, balance, value_usd).await {
                Ok(detection) => {
                    report.detections_created += 1;
                    detection
                }
                // A concurrent registration of the same asset may have created it first.
                Err(e) => match self.store.find_detection(wallet, asset).await? {
                    Some(existing) => existing,
                    None => return Err(e),
                },
            },
        };

        if detection.transferable {
            return Ok(true);
        }
        if !self.ledger.is_transferable(asset).await? {
            debug!(wallet, asset, "Still locked");
            return Ok(true);
        }

        // Only the caller that flips the stored flag reports the transition.
        if !self.store.mark_transferable(wallet, asset).await? {
            debug!(wallet, asset, "Transition already recorded");
            return Ok(true);
        }
        detection.transferable = true;
        report.transitions += 1;

        info!(
            wallet,
            asset,
            symbol = %detection.symbol,
            balance = %detection.balance,
            "Transferability enabled"
        );
        self.append(
            wallet,
            asset,
            ActivityKind::TransferabilityEnabled,
            format!("{} ({}) is now transferable", detection.name, detection.symbol),
        )
        .await;
        self.events.publish(
            EventKind::TradingEnabled,
            json!({
                "detection_id": detection.id,
                "asset": asset,
                "symbol": detection.symbol,
                "balance": detection.balance,
                "value_usd": detection.value_usd,
            }),
            Some(wallet),
        );

        if self.auto_sweep_enabled(wallet).await {
            report.sweeps_triggered += 1;
            let request = SweepRequest::from_detection(&detection, Urgency::High);
            match self.executor.sweep(request).await {
                Ok(outcome) => info!(wallet, asset, outcome = ?outcome, "Auto sweep finished"),
                Err(e) => warn!(wallet, asset, error = %e, "Auto sweep rejected"),
            }
        }
        Ok(true)
    }

    async fn record_detection(
        &self,
        wallet: &str,
        asset: &str,
        balance: Decimal,
        value_usd: Option<Decimal>,
    ) -> Result<AssetDetection> {
        let metadata = match self.ledger.get_asset_metadata(asset).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(asset, error = %e, "Metadata lookup failed, using placeholder");
                AssetMetadata::unknown(asset)
            }
        };
        let mut detection = AssetDetection::new(wallet, asset, &metadata, balance);
        detection.value_usd = value_usd;
        self.store.create_detection(&detection).await?;

        info!(
            wallet,
            asset,
            symbol = %detection.symbol,
            balance = %balance,
            "New asset detected"
        );
        self.append(
            wallet,
            asset,
            ActivityKind::Detected,
            format!("Detected {} {} ({})", balance, detection.symbol, detection.name),
        )
        .await;
        self.events.publish(
            EventKind::TokenDetected,
            json!({
                "detection_id": detection.id,
                "asset": asset,
                "name": detection.name,
                "symbol": detection.symbol,
                "decimals": detection.decimals,
                "balance": balance,
                "value_usd": value_usd,
            }),
            Some(wallet),
        );
        Ok(detection)
    }

    async fn auto_sweep_enabled(&self, wallet: &str) -> bool {
        match self.store.get_wallet(wallet).await {
            Ok(Some(config)) => config.auto_sweep && config.active,
            Ok(None) => {
                debug!(wallet, "No wallet config, auto sweep off");
                false
            }
            Err(e) => {
                warn!(wallet, error = %e, "Failed to load wallet config");
                false
            }
        }
    }

    async fn price(&self, asset: &str) -> Option<Decimal> {
        match self.prices.asset_usd(asset).await {
            Ok(price) => price,
            Err(e) => {
                debug!(asset, error = %e, "Price unavailable");
                None
            }
        }
    }

    async fn append(&self, wallet: &str, asset: &str, kind: ActivityKind, message: String) {
        let record = ActivityRecord::new(wallet, Some(asset), kind, message);
        if let Err(e) = self.store.append_activity(&record).await {
            warn!(wallet, kind = %kind, error = %e, "Failed to append activity");
        }
    }
}

fn normalize_pair(wallet: &str, asset: &str) -> SweepResult<(String, String)> {
    let wallet =
        normalize_id(wallet).ok_or_else(|| SweepError::WalletNotFound(wallet.to_string()))?;
    let asset = normalize_id(asset).ok_or_else(|| SweepError::InvalidAsset(asset.to_string()))?;
    Ok((wallet, asset))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
