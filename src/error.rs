//! Engine-level error taxonomy.
//!
//! Collaborator traits (ledger, store, prices) return `anyhow::Result`;
//! the engine wraps those failures here so callers can tell a transient
//! ledger problem from a configuration problem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    /// No configuration stored for the wallet.
    #[error("wallet {0} is not configured")]
    WalletNotFound(String),

    /// Configuration exists but the wallet is deactivated.
    #[error("wallet {0} is inactive")]
    WalletInactive(String),

    /// Asset registration for a wallet that isn't being monitored.
    #[error("wallet {0} is not monitored")]
    NotMonitored(String),

    /// Manual action requested for an asset that was never detected.
    #[error("no detection for asset {asset} in wallet {wallet}")]
    NotDetected { wallet: String, asset: String },

    #[error("invalid asset identifier: {0:?}")]
    InvalidAsset(String),

    /// Wallet configuration holds a value the engine cannot use.
    #[error("invalid configuration for wallet {wallet}: {reason}")]
    InvalidConfig { wallet: String, reason: String },

    #[error("ledger error: {0:#}")]
    Ledger(anyhow::Error),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    #[error("fee estimation failed: {0:#}")]
    Fee(anyhow::Error),
}

impl SweepError {
    /// Configuration errors are not retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SweepError::WalletNotFound(_)
                | SweepError::WalletInactive(_)
                | SweepError::InvalidConfig { .. }
        )
    }
}

pub type SweepResult<T> = Result<T, SweepError>;
