//! Ledger integration.
//!
//! Defines the `LedgerClient` trait the engine talks through and the
//! `Keyring` seam that supplies signer credentials. The only concrete
//! client is the EVM JSON-RPC adapter in [`jsonrpc`].

pub mod abi;
pub mod jsonrpc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;

use crate::types::{AssetMetadata, Receipt, WalletConfig};

/// Credentials handed to the ledger when submitting a transfer.
#[derive(Debug, Clone)]
pub struct WalletCredentials {
    /// Sending account.
    pub address: String,
    /// Authorisation for the signing endpoint.
    pub secret: SecretString,
}

/// Abstraction over the distributed ledger.
///
/// Amounts cross this boundary in human units; fee prices and base fees
/// are in the ledger's smallest native unit (wei). Implementations are
/// assumed slow and rate-limited, so callers avoid parallel fan-out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Balance of `asset` held by `wallet`.
    async fn get_balance(&self, wallet: &str, asset: &str) -> Result<Decimal>;

    /// Name, symbol, and decimals of an asset.
    async fn get_asset_metadata(&self, asset: &str) -> Result<AssetMetadata>;

    /// Composite transferability check. True once any sub-check indicates
    /// that transfers are enabled.
    async fn is_transferable(&self, asset: &str) -> Result<bool>;

    /// Current base fee observation.
    async fn get_base_fee(&self) -> Result<u128>;

    /// Gas units needed to transfer `amount` of `asset`.
    async fn estimate_transfer_gas(
        &self,
        asset: &str,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<u64>;

    /// Submit a transfer and return the transaction reference.
    async fn submit_transfer(
        &self,
        credentials: &WalletCredentials,
        asset: &str,
        to: &str,
        amount: Decimal,
        fee_price: u128,
    ) -> Result<String>;

    /// Receipt for a submitted transaction, `None` while unconfirmed.
    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>>;
}

/// Supplies submission credentials for a configured wallet.
pub trait Keyring: Send + Sync {
    fn credentials(&self, wallet: &WalletConfig) -> Result<WalletCredentials>;
}

/// Reads each wallet's credential from the env var named in its config.
#[derive(Debug, Default, Clone)]
pub struct EnvKeyring;

impl Keyring for EnvKeyring {
    fn credentials(&self, wallet: &WalletConfig) -> Result<WalletCredentials> {
        let env_name = wallet
            .credential_env
            .as_deref()
            .with_context(|| format!("No credential env configured for wallet {}", wallet.address))?;
        let secret = std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))?;
        Ok(WalletCredentials {
            address: wallet.address.clone(),
            secret: SecretString::new(secret),
        })
    }
}

/// Hands the same credential to every wallet. Used for local signer
/// endpoints that don't authenticate per account.
#[derive(Debug, Clone)]
pub struct StaticKeyring {
    secret: SecretString,
}

impl StaticKeyring {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::new(secret.into()),
        }
    }
}

impl Keyring for StaticKeyring {
    fn credentials(&self, wallet: &WalletConfig) -> Result<WalletCredentials> {
        Ok(WalletCredentials {
            address: wallet.address.clone(),
            secret: self.secret.clone(),
        })
    }
}
