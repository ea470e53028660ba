//! In-process store backed by `RwLock`ed maps.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::SweepStore;
use crate::types::{
    ActivityRecord, AssetDetection, NetworkStatus, SweepAttempt, SweepStatus, WalletConfig,
};

#[derive(Default)]
pub struct MemoryStore {
    wallets: RwLock<HashMap<String, WalletConfig>>,
    transactions: RwLock<HashMap<String, SweepAttempt>>,
    detections: RwLock<HashMap<String, AssetDetection>>,
    activity: RwLock<Vec<ActivityRecord>>,
    network: RwLock<Option<NetworkStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SweepStore for MemoryStore {
    async fn get_wallet(&self, address: &str) -> Result<Option<WalletConfig>> {
        Ok(self.wallets.read().await.get(address).cloned())
    }

    async fn create_wallet(&self, wallet: &WalletConfig) -> Result<()> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(&wallet.address) {
            bail!("Wallet {} already exists", wallet.address);
        }
        wallets.insert(wallet.address.clone(), wallet.clone());
        Ok(())
    }

    async fn update_wallet(&self, wallet: &WalletConfig) -> Result<()> {
        let mut wallets = self.wallets.write().await;
        match wallets.get_mut(&wallet.address) {
            Some(existing) => {
                *existing = wallet.clone();
                Ok(())
            }
            None => bail!("Wallet {} not found", wallet.address),
        }
    }

    async fn list_wallets(&self) -> Result<Vec<WalletConfig>> {
        let mut wallets: Vec<_> = self.wallets.read().await.values().cloned().collect();
        wallets.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(wallets)
    }

    async fn create_transaction(&self, attempt: &SweepAttempt) -> Result<()> {
        let mut txs = self.transactions.write().await;
        if txs.contains_key(&attempt.id) {
            bail!("Transaction {} already exists", attempt.id);
        }
        txs.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<SweepAttempt>> {
        Ok(self.transactions.read().await.get(id).cloned())
    }

    async fn update_transaction(&self, attempt: &SweepAttempt) -> Result<()> {
        let mut txs = self.transactions.write().await;
        match txs.get_mut(&attempt.id) {
            Some(existing) => {
                *existing = attempt.clone();
                Ok(())
            }
            None => bail!("Transaction {} not found", attempt.id),
        }
    }

    async fn list_transactions(
        &self,
        wallet: &str,
        status: Option<SweepStatus>,
    ) -> Result<Vec<SweepAttempt>> {
        let mut txs: Vec<_> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|t| t.wallet == wallet && status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txs)
    }

    async fn create_detection(&self, detection: &AssetDetection) -> Result<()> {
        let mut detections = self.detections.write().await;
        if detections
            .values()
            .any(|d| d.wallet == detection.wallet && d.asset == detection.asset)
        {
            bail!(
                "Detection for {} in {} already exists",
                detection.asset,
                detection.wallet
            );
        }
        detections.insert(detection.id.clone(), detection.clone());
        Ok(())
    }

    async fn get_detection(&self, id: &str) -> Result<Option<AssetDetection>> {
        Ok(self.detections.read().await.get(id).cloned())
    }

    async fn find_detection(&self, wallet: &str, asset: &str) -> Result<Option<AssetDetection>> {
        Ok(self
            .detections
            .read()
            .await
            .values()
            .find(|d| d.wallet == wallet && d.asset == asset)
            .cloned())
    }

    async fn list_detections(&self, wallet: &str) -> Result<Vec<AssetDetection>> {
        let mut detections: Vec<_> = self
            .detections
            .read()
            .await
            .values()
            .filter(|d| d.wallet == wallet)
            .cloned()
            .collect();
        detections.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(detections)
    }

    async fn update_detection(&self, detection: &AssetDetection) -> Result<()> {
        let mut detections = self.detections.write().await;
        match detections.get_mut(&detection.id) {
            Some(existing) => {
                let transferable = existing.transferable || detection.transferable;
                *existing = detection.clone();
                existing.transferable = transferable;
                Ok(())
            }
            None => bail!("Detection {} not found", detection.id),
        }
    }

    async fn mark_transferable(&self, wallet: &str, asset: &str) -> Result<bool> {
        let mut detections = self.detections.write().await;
        match detections
            .values_mut()
            .find(|d| d.wallet == wallet && d.asset == asset)
        {
            Some(existing) if existing.transferable => Ok(false),
            Some(existing) => {
                existing.transferable = true;
                Ok(true)
            }
            None => bail!("No detection for {asset} in wallet {wallet}"),
        }
    }

    async fn append_activity(&self, record: &ActivityRecord) -> Result<()> {
        self.activity.write().await.push(record.clone());
        Ok(())
    }

    async fn list_activity(&self, wallet: Option<&str>, limit: usize) -> Result<Vec<ActivityRecord>> {
        Ok(self
            .activity
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| wallet.map_or(true, |w| r.wallet == w))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_network_status(&self) -> Result<Option<NetworkStatus>> {
        Ok(self.network.read().await.clone())
    }

    async fn update_network_status(&self, status: &NetworkStatus) -> Result<()> {
        *self.network.write().await = Some(status.clone());
        Ok(())
    }
}
