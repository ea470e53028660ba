//! Persistence layer.
//!
//! The engine talks to storage through the narrow [`SweepStore`] trait.
//! [`MemoryStore`] keeps everything in process (tests, dry runs) and
//! [`SqliteStore`] persists to a SQLite file through sqlx. Both expect
//! identifiers already normalised by the caller.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::types::{
    ActivityRecord, AssetDetection, NetworkStatus, SweepAttempt, SweepStatus, WalletConfig,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Ledger and activity store used by the engine.
#[async_trait]
pub trait SweepStore: Send + Sync {
    // -- Wallet configuration ------------------------------------------------

    async fn get_wallet(&self, address: &str) -> Result<Option<WalletConfig>>;
    async fn create_wallet(&self, wallet: &WalletConfig) -> Result<()>;
    async fn update_wallet(&self, wallet: &WalletConfig) -> Result<()>;
    async fn list_wallets(&self) -> Result<Vec<WalletConfig>>;

    // -- Transactions --------------------------------------------------------

    async fn create_transaction(&self, attempt: &SweepAttempt) -> Result<()>;
    async fn get_transaction(&self, id: &str) -> Result<Option<SweepAttempt>>;
    async fn update_transaction(&self, attempt: &SweepAttempt) -> Result<()>;
    /// Newest first.
    async fn list_transactions(
        &self,
        wallet: &str,
        status: Option<SweepStatus>,
    ) -> Result<Vec<SweepAttempt>>;

    // -- Detections ----------------------------------------------------------

    async fn create_detection(&self, detection: &AssetDetection) -> Result<()>;
    async fn get_detection(&self, id: &str) -> Result<Option<AssetDetection>>;
    async fn find_detection(&self, wallet: &str, asset: &str) -> Result<Option<AssetDetection>>;
    async fn list_detections(&self, wallet: &str) -> Result<Vec<AssetDetection>>;
    async fn update_detection(&self, detection: &AssetDetection) -> Result<()>;
    /// Flip the transferable flag from false to true. Returns true only for
    /// the caller that performed the flip.
    async fn mark_transferable(&self, wallet: &str, asset: &str) -> Result<bool>;

    // -- Activity log --------------------------------------------------------

    async fn append_activity(&self, record: &ActivityRecord) -> Result<()>;
    /// Newest first, optionally restricted to one wallet.
    async fn list_activity(&self, wallet: Option<&str>, limit: usize) -> Result<Vec<ActivityRecord>>;

    // -- Network status ------------------------------------------------------

    async fn get_network_status(&self) -> Result<Option<NetworkStatus>>;
    async fn update_network_status(&self, status: &NetworkStatus) -> Result<()>;
}

/// Insert or replace a wallet configuration.
pub async fn upsert_wallet(store: &dyn SweepStore, wallet: &WalletConfig) -> Result<()> {
    if store.get_wallet(&wallet.address).await?.is_some() {
        store.update_wallet(wallet).await
    } else {
        store.create_wallet(wallet).await
    }
}

/// Open the store named by the configuration.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn SweepStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = SqliteStore::connect(url).await?;
            info!(url, "SQLite store opened");
            Ok(Arc::new(store))
        }
        None => {
            info!("No database configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
