//! Fiat price sources.
//!
//! The engine never assumes a price is accurate; it only needs a
//! pluggable lookup to value balances against each wallet's minimum
//! transfer threshold and to show fee costs in fiat terms.

pub mod coingecko;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PricesConfig;
use crate::types::normalize_id;

/// Abstraction over fiat price lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// USD price of one unit of `asset`, `None` when unknown.
    async fn asset_usd(&self, asset: &str) -> Result<Option<Decimal>>;

    /// USD price of one unit of the native fee asset.
    async fn native_usd(&self) -> Result<Option<Decimal>>;
}

/// Build the price source named by `config.provider`.
pub fn from_config(config: &PricesConfig) -> Result<Arc<dyn PriceSource>> {
    match config.provider.to_lowercase().as_str() {
        "coingecko" => {
            info!(platform = %config.coingecko_platform, "Using CoinGecko prices");
            Ok(Arc::new(coingecko::CoinGeckoPriceSource::new(config)?))
        }
        "static" => Ok(Arc::new(StaticPriceSource::from_config(config))),
        other => {
            warn!(provider = other, "Unknown price provider, using static table");
            Ok(Arc::new(StaticPriceSource::from_config(config)))
        }
    }
}

/// Value of `amount` at `price`, rounded to cents.
pub fn fiat_value(amount: Decimal, price: Option<Decimal>) -> Option<Decimal> {
    price.and_then(|p| amount.checked_mul(p)).map(|v| v.round_dp(2))
}

/// Fixed price table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    prices: HashMap<String, Decimal>,
    native: Option<Decimal>,
}

impl StaticPriceSource {
    pub fn new(prices: HashMap<String, Decimal>, native: Option<Decimal>) -> Self {
        let prices = prices
            .into_iter()
            .filter_map(|(k, v)| normalize_id(&k).map(|k| (k, v)))
            .collect();
        Self { prices, native }
    }

    pub fn from_config(config: &PricesConfig) -> Self {
        Self::new(config.static_prices.clone(), config.native_usd)
    }

    pub fn with_price(mut self, asset: &str, price: Decimal) -> Self {
        if let Some(key) = normalize_id(asset) {
            self.prices.insert(key, price);
        }
        self
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn asset_usd(&self, asset: &str) -> Result<Option<Decimal>> {
        Ok(normalize_id(asset).and_then(|k| self.prices.get(&k).copied()))
    }

    async fn native_usd(&self) -> Result<Option<Decimal>> {
        Ok(self.native)
    }
}
