//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (signer credentials, price API keys) are referenced by env-var
//! name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::types::{normalize_id, KnownAsset, WalletConfig};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    /// Static catalog of well-known assets scanned for every wallet.
    #[serde(default)]
    pub assets: Vec<KnownAsset>,
    #[serde(default)]
    pub wallets: Vec<WalletEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            scan_interval_secs: default_scan_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Endpoint accepting `eth_sendTransaction`; defaults to `rpc_url`.
    #[serde(default)]
    pub signer_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    #[serde(default)]
    pub transferability: TransferabilityConfig,
}

/// Sub-checks of the composite transferability heuristic.
#[derive(Debug, Deserialize, Clone)]
pub struct TransferabilityConfig {
    /// Zero-argument boolean view functions called on the asset.
    #[serde(default = "default_flag_functions")]
    pub flag_functions: Vec<String>,
    /// Pair factory exposing `getPair(address,address)`.
    #[serde(default)]
    pub pair_factory: Option<String>,
    /// Quote asset paired against in the factory lookup.
    #[serde(default)]
    pub quote_asset: Option<String>,
    /// Blocks searched for `Transfer` logs; 0 disables the check.
    #[serde(default = "default_lookback")]
    pub activity_lookback_blocks: u64,
}

impl Default for TransferabilityConfig {
    fn default() -> Self {
        Self {
            flag_functions: default_flag_functions(),
            pair_factory: None,
            quote_asset: None,
            activity_lookback_blocks: default_lookback(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeeConfig {
    /// Minimum viable fee price in gwei.
    #[serde(default = "default_floor_gwei")]
    pub floor_gwei: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            floor_gwei: default_floor_gwei(),
            sample_interval_secs: default_sample_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfirmationConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            interval_secs: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricesConfig {
    /// "static" | "coingecko"
    #[serde(default = "default_price_provider")]
    pub provider: String,
    /// Fiat price of the native fee asset.
    #[serde(default)]
    pub native_usd: Option<Decimal>,
    /// Fixed per-asset prices keyed by asset address.
    #[serde(default, rename = "static")]
    pub static_prices: HashMap<String, Decimal>,
    /// CoinGecko asset platform id used for token lookups.
    #[serde(default = "default_coingecko_platform")]
    pub coingecko_platform: String,
    /// CoinGecko coin id of the native fee asset.
    #[serde(default = "default_coingecko_native_id")]
    pub coingecko_native_id: String,
    #[serde(default)]
    pub coingecko_api_key_env: Option<String>,
    #[serde(default = "default_price_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            provider: default_price_provider(),
            native_usd: None,
            static_prices: HashMap::new(),
            coingecko_platform: default_coingecko_platform(),
            coingecko_native_id: default_coingecko_native_id(),
            coingecko_api_key_env: None,
            cache_ttl_secs: default_price_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// SQLite URL (e.g. `sqlite://sweeper.db`); in-memory store when unset.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

/// One `[[wallets]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct WalletEntry {
    pub address: String,
    pub safe_address: String,
    #[serde(default = "default_strategy")]
    pub fee_strategy: String,
    #[serde(default = "default_min_transfer")]
    pub min_transfer_usd: Decimal,
    #[serde(default = "default_true")]
    pub auto_sweep: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub credential_env: Option<String>,
    /// Extra assets registered for this wallet at startup.
    #[serde(default)]
    pub assets: Vec<String>,
}

impl WalletEntry {
    /// Convert to the persisted configuration, normalising addresses.
    pub fn to_wallet_config(&self) -> Result<WalletConfig> {
        let address = normalize_id(&self.address).context("Wallet address is empty")?;
        let safe_address = normalize_id(&self.safe_address)
            .with_context(|| format!("Safe address for wallet {address} is empty"))?;
        Ok(WalletConfig {
            address,
            safe_address,
            fee_strategy: self.fee_strategy.clone(),
            min_transfer_usd: self.min_transfer_usd,
            auto_sweep: self.auto_sweep,
            active: self.active,
            credential_env: self.credential_env.clone(),
        })
    }
}

fn default_name() -> String {
    "SWEEPER-001".to_string()
}
fn default_scan_interval() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    30
}
fn default_native_symbol() -> String {
    "ETH".to_string()
}
fn default_flag_functions() -> Vec<String> {
    vec![
        "tradingEnabled()".to_string(),
        "tradingOpen()".to_string(),
        "tradingActive()".to_string(),
    ]
}
fn default_lookback() -> u64 {
    50
}
fn default_floor_gwei() -> u64 {
    1
}
fn default_sample_interval() -> u64 {
    30
}
fn default_initial_delay() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    60
}
fn default_price_provider() -> String {
    "static".to_string()
}
fn default_coingecko_platform() -> String {
    "ethereum".to_string()
}
fn default_coingecko_native_id() -> String {
    "ethereum".to_string()
}
fn default_price_ttl() -> u64 {
    60
}
fn default_strategy() -> String {
    "standard".to_string()
}
fn default_min_transfer() -> Decimal {
    dec!(10)
}
fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.engine.scan_interval_secs.max(1))
    }
}
