//! End-to-end tests: detection, transferability transitions, and sweeps
//! wired through the real engine with an in-memory store and a mock
//! ledger.

mod detection;
mod mock_ledger;
mod scheduling;
mod sweep;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use sweeper::config::FeeConfig;
use sweeper::engine::detector::DetectionEngine;
use sweeper::engine::fees::FeeOptimizer;
use sweeper::engine::sweeper::{ConfirmationPolicy, SweepExecutor};
use sweeper::events::{BroadcastSink, EventSink};
use sweeper::ledger::{LedgerClient, StaticKeyring};
use sweeper::pricing::{PriceSource, StaticPriceSource};
use sweeper::storage::{MemoryStore, SweepStore};
use sweeper::types::{KnownAsset, WalletConfig};

use mock_ledger::MockLedger;

pub const WALLET: &str = "0xaaaa000000000000000000000000000000000001";
pub const SAFE: &str = "0xbbbb000000000000000000000000000000000002";
pub const TOKEN: &str = "0xcccc000000000000000000000000000000000003";
pub const OTHER: &str = "0xdddd000000000000000000000000000000000004";
pub const GWEI: u128 = 1_000_000_000;

/// Everything a test needs, sharing one store, ledger, and event bus.
pub struct Harness {
    pub ledger: MockLedger,
    pub store: Arc<MemoryStore>,
    pub sink: BroadcastSink,
    pub fees: Arc<FeeOptimizer>,
    pub executor: Arc<SweepExecutor>,
    pub engine: Arc<DetectionEngine>,
}

pub struct HarnessBuilder {
    base_fee: u128,
    prices: StaticPriceSource,
    catalog: Vec<KnownAsset>,
    policy: ConfirmationPolicy,
    scan_interval: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            base_fee: 20 * GWEI,
            prices: StaticPriceSource::new(Default::default(), Some(dec!(2000))),
            catalog: Vec::new(),
            policy: fast_policy(3),
            scan_interval: Duration::from_secs(3600),
        }
    }

    pub fn base_fee(mut self, base_fee: u128) -> Self {
        self.base_fee = base_fee;
        self
    }

    pub fn price(mut self, asset: &str, price: Decimal) -> Self {
        self.prices = self.prices.with_price(asset, price);
        self
    }

    pub fn catalog(mut self, assets: &[&str]) -> Self {
        self.catalog = assets
            .iter()
            .map(|a| KnownAsset {
                address: a.to_string(),
                symbol: String::new(),
            })
            .collect();
        self
    }

    pub fn policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn build(self) -> Harness {
        let ledger = MockLedger::new(self.base_fee);
        let store = Arc::new(MemoryStore::new());
        let sink = BroadcastSink::new();

        let ledger_dyn: Arc<dyn LedgerClient> = Arc::new(ledger.clone());
        let store_dyn: Arc<dyn SweepStore> = store.clone();
        let events: Arc<dyn EventSink> = Arc::new(sink.clone());
        let prices: Arc<dyn PriceSource> = Arc::new(self.prices);

        let fees = Arc::new(FeeOptimizer::new(
            &FeeConfig::default(),
            ledger_dyn.clone(),
            store_dyn.clone(),
            events.clone(),
            prices.clone(),
        ));
        let executor = Arc::new(SweepExecutor::new(
            store_dyn.clone(),
            ledger_dyn.clone(),
            fees.clone(),
            prices.clone(),
            events.clone(),
            Arc::new(StaticKeyring::new("integration")),
            self.policy,
        ));
        let (engine, rx) = DetectionEngine::new(
            store_dyn,
            ledger_dyn,
            prices,
            events,
            executor.clone(),
            &self.catalog,
            self.scan_interval,
        );
        engine.spawn_dispatcher(rx);

        Harness {
            ledger,
            store,
            sink,
            fees,
            executor,
            engine,
        }
    }
}

/// Receipt polling with no initial delay and short intervals.
pub fn fast_policy(max_attempts: u32) -> ConfirmationPolicy {
    ConfirmationPolicy {
        initial_delay: Duration::ZERO,
        interval: Duration::from_millis(10),
        max_attempts,
    }
}

pub fn wallet_config(auto_sweep: bool, strategy: &str) -> WalletConfig {
    WalletConfig {
        address: WALLET.to_string(),
        safe_address: SAFE.to_string(),
        fee_strategy: strategy.to_string(),
        min_transfer_usd: dec!(10),
        auto_sweep,
        active: true,
        credential_env: None,
    }
}

impl Harness {
    pub async fn with_wallet(self, config: WalletConfig) -> Self {
        self.store.create_wallet(&config).await.unwrap();
        self
    }
}
