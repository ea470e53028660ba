//! Fee-price selection.
//!
//! Combines the ledger's live base fee with three multipliers: the
//! wallet's fee strategy, the caller's urgency, and the network
//! congestion level observed by the background sampler. The result is
//! never below the configured floor.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeeConfig;
use crate::events::{EventKind, EventSink};
use crate::ledger::abi::{scale_down, scale_up};
use crate::ledger::LedgerClient;
use crate::pricing::{fiat_value, PriceSource};
use crate::storage::SweepStore;
use crate::types::{CongestionLevel, FeeStrategy, NetworkStatus, Urgency};

pub const GWEI: u128 = 1_000_000_000;

/// Decimals of the native fee asset.
const NATIVE_DECIMALS: u8 = 18;

// ---------------------------------------------------------------------------
// Multipliers
// ---------------------------------------------------------------------------

pub fn strategy_multiplier(strategy: FeeStrategy) -> Decimal {
    match strategy {
        FeeStrategy::Conservative => dec!(0.90),
        FeeStrategy::Standard => dec!(1.00),
        FeeStrategy::Aggressive => dec!(1.30),
    }
}

pub fn urgency_multiplier(urgency: Urgency) -> Decimal {
    match urgency {
        Urgency::Low => dec!(0.85),
        Urgency::Medium => dec!(1.00),
        Urgency::High => dec!(1.50),
    }
}

pub fn congestion_multiplier(level: CongestionLevel) -> Decimal {
    match level {
        CongestionLevel::Low => dec!(0.95),
        CongestionLevel::Medium => dec!(1.00),
        CongestionLevel::High => dec!(1.10),
        CongestionLevel::VeryHigh => dec!(1.20),
    }
}

/// Bucket a base fee (wei) into a congestion level.
pub fn classify(base_fee: u128) -> CongestionLevel {
    if base_fee < 15 * GWEI {
        CongestionLevel::Low
    } else if base_fee < 40 * GWEI {
        CongestionLevel::Medium
    } else if base_fee < 100 * GWEI {
        CongestionLevel::High
    } else {
        CongestionLevel::VeryHigh
    }
}

/// Projected cost of a transfer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostEstimate {
    pub gas_limit: u64,
    /// Wei per gas unit.
    pub fee_price: u128,
    /// Total in native units.
    pub cost_native: Decimal,
    pub cost_usd: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

pub struct FeeOptimizer {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn SweepStore>,
    events: Arc<dyn EventSink>,
    prices: Arc<dyn PriceSource>,
    floor: u128,
    last_sample: RwLock<Option<NetworkStatus>>,
}

impl FeeOptimizer {
    pub fn new(
        config: &FeeConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn SweepStore>,
        events: Arc<dyn EventSink>,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            ledger,
            store,
            events,
            prices,
            floor: config.floor_gwei as u128 * GWEI,
            last_sample: RwLock::new(None),
        }
    }

    pub fn floor(&self) -> u128 {
        self.floor
    }

    /// Last sampled network status, if any.
    pub async fn network_status(&self) -> Option<NetworkStatus> {
        self.last_sample.read().await.clone()
    }

    /// Sample the base fee and record the congestion level.
    pub async fn sample(&self) -> Result<NetworkStatus> {
        let base_fee = self
            .ledger
            .get_base_fee()
            .await
            .context("Failed to sample base fee")?;
        let status = NetworkStatus {
            base_fee,
            congestion: classify(base_fee),
            sampled_at: Utc::now(),
        };

        *self.last_sample.write().await = Some(status.clone());
        self.store
            .update_network_status(&status)
            .await
            .context("Failed to persist network status")?;
        self.events.publish(
            EventKind::NetworkStatus,
            json!({
                "base_fee": status.base_fee.to_string(),
                "base_fee_gwei": (status.base_fee / GWEI).to_string(),
                "congestion": status.congestion,
            }),
            None,
        );

        debug!(
            base_fee = %status.base_fee,
            congestion = %status.congestion,
            "Network status sampled"
        );
        Ok(status)
    }

    /// Run [`sample`](Self::sample) every `interval` until the handle is aborted.
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Fee sampler started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sample().await {
                    warn!(error = %e, "Fee sample failed");
                }
            }
        })
    }

    /// Pure price computation used by [`fee_price`](Self::fee_price).
    pub fn compute(
        &self,
        base_fee: u128,
        strategy: FeeStrategy,
        urgency: Urgency,
        congestion: CongestionLevel,
    ) -> Result<u128> {
        let price = scale_down(base_fee, 0)?
            * strategy_multiplier(strategy)
            * urgency_multiplier(urgency)
            * congestion_multiplier(congestion);
        Ok(scale_up(price, 0)?.max(self.floor))
    }

    /// Fee price (wei) for a transaction submitted now.
    pub async fn fee_price(&self, strategy: FeeStrategy, urgency: Urgency) -> Result<u128> {
        let base_fee = self
            .ledger
            .get_base_fee()
            .await
            .context("Failed to fetch base fee")?;
        let congestion = match self.last_sample.read().await.as_ref() {
            Some(sample) => sample.congestion,
            None => classify(base_fee),
        };
        let price = self.compute(base_fee, strategy, urgency, congestion)?;
        debug!(
            base_fee = %base_fee,
            strategy = %strategy,
            urgency = %urgency,
            congestion = %congestion,
            price = %price,
            "Fee price selected"
        );
        Ok(price)
    }

    /// Projected cost of transferring `amount` of `asset` at `strategy`.
    pub async fn estimate_cost(
        &self,
        asset: &str,
        from: &str,
        to: &str,
        amount: Decimal,
        strategy: FeeStrategy,
    ) -> Result<CostEstimate> {
        let gas_limit = self
            .ledger
            .estimate_transfer_gas(asset, from, to, amount)
            .await
            .context("Failed to estimate transfer gas")?;
        let fee_price = self.fee_price(strategy, Urgency::Medium).await?;
        let total = (gas_limit as u128)
            .checked_mul(fee_price)
            .context("Fee cost overflows")?;
        let cost_native = scale_down(total, NATIVE_DECIMALS)?;

        let native_price = match self.prices.native_usd().await {
            Ok(price) => price,
            Err(e) => {
                warn!(error = %e, "Native price unavailable");
                None
            }
        };

        Ok(CostEstimate {
            gas_limit,
            fee_price,
            cost_native,
            cost_usd: fiat_value(cost_native, native_price),
        })
    }

    /// Strategy suited to the last observed congestion.
    pub async fn recommend_strategy(&self) -> FeeStrategy {
        match self.last_sample.read().await.as_ref().map(|s| s.congestion) {
            Some(CongestionLevel::Low) => FeeStrategy::Conservative,
            Some(CongestionLevel::High | CongestionLevel::VeryHigh) => FeeStrategy::Aggressive,
            Some(CongestionLevel::Medium) | None => FeeStrategy::Standard,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
