//! Mock ledger for integration testing.
//!
//! Provides a deterministic `LedgerClient` implementation with
//! controllable balances, transferability flags, fees, and receipts,
//! all in-memory with no external dependencies.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sweeper::ledger::{LedgerClient, WalletCredentials};
use sweeper::types::{AssetMetadata, Receipt};

/// A transfer accepted by the mock.
#[derive(Debug, Clone)]
pub struct Submission {
    pub from: String,
    pub asset: String,
    pub to: String,
    pub amount: Decimal,
    pub fee_price: u128,
    pub tx_hash: String,
}

#[derive(Default)]
struct State {
    balances: HashMap<(String, String), Decimal>,
    transferable: HashMap<String, bool>,
    failing_assets: HashSet<String>,
    base_fee: u128,
    balance_delay: Option<Duration>,
    transfer_check_delay: Option<Duration>,
    submit_delay: Option<Duration>,
    submissions: Vec<Submission>,
    receipts: HashMap<String, Receipt>,
    receipt_queries: u32,
    balance_queries: u32,
    force_error: Option<String>,
}

/// A mock ledger for deterministic testing.
///
/// All state sits behind one mutex and is fully controllable from test
/// code. Clones share state.
#[derive(Clone)]
pub struct MockLedger {
    state: Arc<Mutex<State>>,
}

impl MockLedger {
    /// A ledger with no balances and the given base fee (wei).
    pub fn new(base_fee: u128) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                base_fee,
                ..State::default()
            })),
        }
    }

    pub fn set_balance(&self, wallet: &str, asset: &str, balance: Decimal) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((wallet.to_lowercase(), asset.to_lowercase()), balance);
    }

    pub fn set_transferable(&self, asset: &str, transferable: bool) {
        self.state
            .lock()
            .unwrap()
            .transferable
            .insert(asset.to_lowercase(), transferable);
    }

    /// Balance queries for `asset` fail until cleared.
    pub fn fail_asset(&self, asset: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_assets
            .insert(asset.to_lowercase());
    }

    pub fn set_base_fee(&self, base_fee: u128) {
        self.state.lock().unwrap().base_fee = base_fee;
    }

    pub fn set_balance_delay(&self, delay: Duration) {
        self.state.lock().unwrap().balance_delay = Some(delay);
    }

    pub fn set_transfer_check_delay(&self, delay: Duration) {
        self.state.lock().unwrap().transfer_check_delay = Some(delay);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = Some(delay);
    }

    /// Make the receipt for `tx_hash` available.
    pub fn set_receipt(&self, tx_hash: &str, receipt: Receipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(tx_hash.to_string(), receipt);
    }

    /// Force transfer submissions to fail with this message.
    pub fn set_error(&self, msg: &str) {
        self.state.lock().unwrap().force_error = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        self.state.lock().unwrap().force_error = None;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn receipt_queries(&self) -> u32 {
        self.state.lock().unwrap().receipt_queries
    }

    /// Balance queries started so far, including ones still delayed.
    pub fn balance_queries(&self) -> u32 {
        self.state.lock().unwrap().balance_queries
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn get_balance(&self, wallet: &str, asset: &str) -> Result<Decimal> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.balance_queries += 1;
            state.balance_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.failing_assets.contains(&asset.to_lowercase()) {
            return Err(anyhow!("rpc error: balance query for {asset} timed out"));
        }
        Ok(state
            .balances
            .get(&(wallet.to_lowercase(), asset.to_lowercase()))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_asset_metadata(&self, asset: &str) -> Result<AssetMetadata> {
        let short: String = asset.chars().skip(2).take(4).collect();
        Ok(AssetMetadata {
            name: format!("Mock Token {short}"),
            symbol: format!("M{}", short.to_uppercase()),
            decimals: 18,
        })
    }

    async fn is_transferable(&self, asset: &str) -> Result<bool> {
        let delay = self.state.lock().unwrap().transfer_check_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .transferable
            .get(&asset.to_lowercase())
            .copied()
            .unwrap_or(false))
    }

    async fn get_base_fee(&self) -> Result<u128> {
        Ok(self.state.lock().unwrap().base_fee)
    }

    async fn estimate_transfer_gas(
        &self,
        _asset: &str,
        _from: &str,
        _to: &str,
        _amount: Decimal,
    ) -> Result<u64> {
        Ok(65_000)
    }

    async fn submit_transfer(
        &self,
        credentials: &WalletCredentials,
        asset: &str,
        to: &str,
        amount: Decimal,
        fee_price: u128,
    ) -> Result<String> {
        let delay = self.state.lock().unwrap().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(ref msg) = state.force_error {
            return Err(anyhow!("{msg}"));
        }
        let tx_hash = format!("0x{:064x}", state.submissions.len() + 1);
        state.submissions.push(Submission {
            from: credentials.address.clone(),
            asset: asset.to_string(),
            to: to.to_string(),
            amount,
            fee_price,
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>> {
        let mut state = self.state.lock().unwrap();
        state.receipt_queries += 1;
        Ok(state.receipts.get(tx_hash).copied())
    }
}
