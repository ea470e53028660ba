//! Shared types for the SWEEPER engine.
//!
//! These types form the data model used across all modules: the
//! persisted records (wallet configuration, detections, sweep attempts,
//! activity), the ledger boundary values, and the small enums that drive
//! fee selection. They are kept free of engine logic so that storage,
//! ledger, and engine modules can depend on them without cycles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Normalise a wallet or asset identifier for use as a map key.
///
/// Ledger addresses are case-insensitive hex, so everything is trimmed and
/// lower-cased. Returns `None` for an empty identifier.
pub fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// A well-known asset from the static catalog scanned for every wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownAsset {
    pub address: String,
    #[serde(default)]
    pub symbol: String,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Caller-specified pressure level for fee selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Urgency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" | "normal" => Ok(Urgency::Medium),
            "high" | "urgent" => Ok(Urgency::High),
            _ => Err(anyhow::anyhow!("Unknown urgency: {s}")),
        }
    }
}

/// Named fee preset applied to the observed base fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStrategy {
    Conservative,
    Standard,
    Aggressive,
}

impl FeeStrategy {
    pub const ALL: &'static [FeeStrategy] = &[
        FeeStrategy::Conservative,
        FeeStrategy::Standard,
        FeeStrategy::Aggressive,
    ];
}

impl fmt::Display for FeeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeStrategy::Conservative => write!(f, "conservative"),
            FeeStrategy::Standard => write!(f, "standard"),
            FeeStrategy::Aggressive => write!(f, "aggressive"),
        }
    }
}

/// Parse a strategy name (case-insensitive, a few aliases accepted).
impl std::str::FromStr for FeeStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conservative" | "slow" | "economy" => Ok(FeeStrategy::Conservative),
            "standard" | "normal" | "default" => Ok(FeeStrategy::Standard),
            "aggressive" | "fast" => Ok(FeeStrategy::Aggressive),
            _ => Err(anyhow::anyhow!("Unknown fee strategy: {s}")),
        }
    }
}

/// Coarse bucketing of current network fee pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionLevel::Low => write!(f, "low"),
            CongestionLevel::Medium => write!(f, "medium"),
            CongestionLevel::High => write!(f, "high"),
            CongestionLevel::VeryHigh => write!(f, "very_high"),
        }
    }
}

impl std::str::FromStr for CongestionLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(CongestionLevel::Low),
            "medium" => Ok(CongestionLevel::Medium),
            "high" => Ok(CongestionLevel::High),
            "very_high" | "very-high" | "veryhigh" => Ok(CongestionLevel::VeryHigh),
            _ => Err(anyhow::anyhow!("Unknown congestion level: {s}")),
        }
    }
}

/// Lifecycle of a persisted sweep attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepStatus {
    Pending,
    Completed,
    Failed,
}

impl SweepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SweepStatus::Pending)
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStatus::Pending => write!(f, "pending"),
            SweepStatus::Completed => write!(f, "completed"),
            SweepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SweepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(SweepStatus::Pending),
            "completed" => Ok(SweepStatus::Completed),
            "failed" => Ok(SweepStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown sweep status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet configuration
// ---------------------------------------------------------------------------

/// Per-wallet configuration consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletConfig {
    /// Watched account address (normalised).
    pub address: String,
    /// Where swept balances are sent.
    pub safe_address: String,
    /// Fee preset name, parsed into [`FeeStrategy`] at sweep time.
    pub fee_strategy: String,
    /// Sweeps worth less than this (in fiat) are not attempted.
    pub min_transfer_usd: Decimal,
    /// Automatically sweep when transferability is first observed.
    pub auto_sweep: bool,
    pub active: bool,
    /// Name of the env var holding this wallet's signer credential.
    #[serde(default)]
    pub credential_env: Option<String>,
}

impl fmt::Display for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {} (strategy: {} | min: ${:.2} | auto: {} | {})",
            self.address,
            self.safe_address,
            self.fee_strategy,
            self.min_transfer_usd,
            if self.auto_sweep { "on" } else { "off" },
            if self.active { "active" } else { "inactive" },
        )
    }
}

// ---------------------------------------------------------------------------
// Detection & activity records
// ---------------------------------------------------------------------------

/// One per (wallet, asset) ever observed with a positive balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetDetection {
    pub id: String,
    pub wallet: String,
    pub asset: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub balance: Decimal,
    /// `None` when no price is known for the asset.
    pub value_usd: Option<Decimal>,
    /// Monotonic: the engine never resets this to false.
    pub transferable: bool,
    pub detected_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

impl AssetDetection {
    /// Fresh detection in the non-transferable state.
    pub fn new(wallet: &str, asset: &str, metadata: &AssetMetadata, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            asset: asset.to_string(),
            name: metadata.name.clone(),
            symbol: metadata.symbol.clone(),
            decimals: metadata.decimals,
            balance,
            value_usd: None,
            transferable: false,
            detected_at: now,
            last_checked: now,
        }
    }
}

impl fmt::Display for AssetDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self
            .value_usd
            .map(|v| format!("${v:.2}"))
            .unwrap_or_else(|| "unpriced".to_string());
        write!(
            f,
            "[{}] {} {} ({}) [{}]",
            self.wallet,
            self.balance,
            self.symbol,
            value,
            if self.transferable { "TRANSFERABLE" } else { "locked" },
        )
    }
}

/// A persisted transfer attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepAttempt {
    pub id: String,
    pub wallet: String,
    pub asset: String,
    pub symbol: String,
    pub amount: Decimal,
    pub value_usd: Option<Decimal>,
    pub status: SweepStatus,
    /// Fee price in wei.
    pub fee_price: u128,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SweepAttempt {
    pub fn pending(
        wallet: &str,
        asset: &str,
        symbol: &str,
        amount: Decimal,
        value_usd: Option<Decimal>,
        fee_price: u128,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            asset: asset.to_string(),
            symbol: symbol.to_string(),
            amount,
            value_usd,
            status: SweepStatus::Pending,
            fee_price,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Whether the attempt has an on-chain confirmation recorded.
    pub fn is_confirmed(&self) -> bool {
        self.block_number.is_some()
    }
}

impl fmt::Display for SweepAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} from {} @ {} wei [{}]",
            self.status,
            self.amount,
            self.symbol,
            self.wallet,
            self.fee_price,
            self.tx_hash.as_deref().unwrap_or("no tx"),
        )
    }
}

/// Kind of engine-observed event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Detected,
    TransferabilityEnabled,
    SweepStarted,
    SweepCompleted,
    SweepFailed,
    SweepConfirmed,
    SweepUnconfirmed,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityKind::Detected => "detected",
            ActivityKind::TransferabilityEnabled => "transferability_enabled",
            ActivityKind::SweepStarted => "sweep_started",
            ActivityKind::SweepCompleted => "sweep_completed",
            ActivityKind::SweepFailed => "sweep_failed",
            ActivityKind::SweepConfirmed => "sweep_confirmed",
            ActivityKind::SweepUnconfirmed => "sweep_unconfirmed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(ActivityKind::Detected),
            "transferability_enabled" => Ok(ActivityKind::TransferabilityEnabled),
            "sweep_started" => Ok(ActivityKind::SweepStarted),
            "sweep_completed" => Ok(ActivityKind::SweepCompleted),
            "sweep_failed" => Ok(ActivityKind::SweepFailed),
            "sweep_confirmed" => Ok(ActivityKind::SweepConfirmed),
            "sweep_unconfirmed" => Ok(ActivityKind::SweepUnconfirmed),
            _ => Err(anyhow::anyhow!("Unknown activity kind: {s}")),
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub id: String,
    pub wallet: String,
    pub asset: Option<String>,
    pub kind: ActivityKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(wallet: &str, asset: Option<&str>, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            asset: asset.map(str::to_string),
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Singleton network-status record maintained by the fee sampler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkStatus {
    /// Last observed base fee in wei.
    pub base_fee: u128,
    pub congestion: CongestionLevel,
    pub sampled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger boundary values
// ---------------------------------------------------------------------------

/// Descriptive metadata for a fungible asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl AssetMetadata {
    /// Placeholder used when the ledger cannot describe an asset.
    pub fn unknown(asset: &str) -> Self {
        let short: String = asset.chars().take(10).collect();
        Self {
            name: format!("Unknown ({short})"),
            symbol: "???".to_string(),
            decimals: 18,
        }
    }
}

/// On-chain confirmation of a submitted transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
