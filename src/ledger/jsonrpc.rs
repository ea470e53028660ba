//! EVM JSON-RPC ledger adapter.
//!
//! Reads balances and ERC-20 metadata with `eth_call`, prices with
//! `eth_gasPrice`, and confirmations with `eth_getTransactionReceipt`.
//! Transfers are handed to a signing endpoint through
//! `eth_sendTransaction`; the wallet credential is sent as a bearer token
//! and the endpoint owns the key material.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::abi;
use super::{LedgerClient, WalletCredentials};
use crate::config::{LedgerConfig, TransferabilityConfig};
use crate::types::{AssetMetadata, Receipt};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Headroom added on top of `eth_estimateGas` when submitting.
const GAS_LIMIT_BUFFER_PCT: u64 = 20;

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    #[serde(default)]
    status: Option<String>,
    gas_used: String,
    block_number: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct JsonRpcLedger {
    http: Client,
    rpc_url: String,
    signer_url: String,
    checks: TransferabilityConfig,
    metadata: RwLock<HashMap<String, AssetMetadata>>,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build ledger HTTP client")?;

        Ok(Self {
            http,
            rpc_url: config.rpc_url.clone(),
            signer_url: config
                .signer_url
                .clone()
                .unwrap_or_else(|| config.rpc_url.clone()),
            checks: config.transferability.clone(),
            metadata: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc(
        &self,
        url: &str,
        method: &str,
        params: Value,
        bearer: Option<&SecretString>,
    ) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let mut request = self.http.post(url).json(&body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{method} HTTP error {status}: {text}");
        }

        let payload: RpcResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {method} response"))?;

        if let Some(err) = payload.error {
            bail!("{method} RPC error {}: {}", err.code, err.message);
        }
        Ok(payload.result)
    }

    async fn eth_call(&self, to: &str, data: String) -> Result<String> {
        let result = self
            .rpc(
                &self.rpc_url,
                "eth_call",
                json!([{ "to": to, "data": data }, "latest"]),
                None,
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("eth_call returned non-string result"))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128> {
        let result = self.rpc(&self.rpc_url, method, params, None).await?;
        let s = result
            .as_str()
            .ok_or_else(|| anyhow!("{method} returned non-string result"))?;
        abi::parse_quantity(s)
    }

    fn transfer_calldata(to: &str, raw_amount: u128) -> Result<String> {
        Ok(abi::encode_call(
            "transfer(address,uint256)",
            &[abi::address_word(to)?, abi::uint_word(raw_amount)],
        ))
    }

    async fn decimals(&self, asset: &str) -> Result<u8> {
        Ok(self.get_asset_metadata(asset).await?.decimals)
    }

    // -- Transferability sub-checks --------------------------------------

    /// Any configured zero-argument flag function returning true.
    /// Reverts are expected for assets without the function.
    async fn flag_enabled(&self, asset: &str) -> bool {
        for signature in &self.checks.flag_functions {
            let data = abi::encode_call(signature, &[]);
            match self.eth_call(asset, data).await.and_then(|r| abi::decode_bool(&r)) {
                Ok(true) => {
                    debug!(asset, function = %signature, "Trading flag set");
                    return true;
                }
                Ok(false) => {}
                Err(e) => debug!(asset, function = %signature, error = %e, "Flag check failed"),
            }
        }
        false
    }

    /// Liquidity pair registered on the configured factory.
    async fn pair_exists(&self, asset: &str) -> Option<Result<bool>> {
        let factory = self.checks.pair_factory.as_deref()?;
        let quote = self.checks.quote_asset.as_deref()?;
        let check = async {
            let data = abi::encode_call(
                "getPair(address,address)",
                &[abi::address_word(asset)?, abi::address_word(quote)?],
            );
            let pair = abi::decode_address(&self.eth_call(factory, data).await?)?;
            Ok::<bool, anyhow::Error>(pair != ZERO_ADDRESS)
        };
        Some(check.await)
    }

    /// Any `Transfer` log emitted by the asset within the look-back window.
    async fn recent_activity(&self, asset: &str) -> Option<Result<bool>> {
        let lookback = self.checks.activity_lookback_blocks;
        if lookback == 0 {
            return None;
        }
        let check = async {
            let latest = self.quantity("eth_blockNumber", json!([])).await?;
            let from = latest.saturating_sub(lookback as u128);
            let logs = self
                .rpc(
                    &self.rpc_url,
                    "eth_getLogs",
                    json!([{
                        "address": asset,
                        "fromBlock": abi::to_quantity(from),
                        "toBlock": "latest",
                        "topics": [abi::event_topic("Transfer(address,address,uint256)")],
                    }]),
                    None,
                )
                .await?;
            Ok::<bool, anyhow::Error>(logs.as_array().map(|l| !l.is_empty()).unwrap_or(false))
        };
        Some(check.await)
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn get_balance(&self, wallet: &str, asset: &str) -> Result<Decimal> {
        let data = abi::encode_call("balanceOf(address)", &[abi::address_word(wallet)?]);
        let raw = abi::decode_uint(&self.eth_call(asset, data).await?)
            .with_context(|| format!("balanceOf({wallet}) on {asset}"))?;
        if raw == 0 {
            return Ok(Decimal::ZERO);
        }
        abi::scale_down(raw, self.decimals(asset).await?)
    }

    async fn get_asset_metadata(&self, asset: &str) -> Result<AssetMetadata> {
        if let Some(meta) = self.metadata.read().await.get(asset) {
            return Ok(meta.clone());
        }

        let decimals = self
            .eth_call(asset, abi::encode_call("decimals()", &[]))
            .await
            .and_then(|r| abi::decode_uint(&r))
            .with_context(|| format!("decimals() on {asset}"))?;
        let decimals = u8::try_from(decimals).with_context(|| format!("decimals() = {decimals}"))?;

        let fallback = AssetMetadata::unknown(asset);
        let symbol = match self.eth_call(asset, abi::encode_call("symbol()", &[])).await {
            Ok(r) => abi::decode_string(&r).unwrap_or(fallback.symbol),
            Err(e) => {
                warn!(asset, error = %e, "symbol() failed");
                fallback.symbol
            }
        };
        let name = match self.eth_call(asset, abi::encode_call("name()", &[])).await {
            Ok(r) => abi::decode_string(&r).unwrap_or(fallback.name),
            Err(e) => {
                warn!(asset, error = %e, "name() failed");
                fallback.name
            }
        };

        let meta = AssetMetadata { name, symbol, decimals };
        self.metadata
            .write()
            .await
            .insert(asset.to_string(), meta.clone());
        Ok(meta)
    }

    async fn is_transferable(&self, asset: &str) -> Result<bool> {
        if self.flag_enabled(asset).await {
            return Ok(true);
        }

        let mut attempted = 0u32;
        let mut failures = 0u32;
        let mut last_error = None;
        // Awaited in order; a positive answer skips the remaining checks.
        let checks: [BoxFuture<'_, Option<Result<bool>>>; 2] = [
            self.pair_exists(asset).boxed(),
            self.recent_activity(asset).boxed(),
        ];
        for check in checks {
            let Some(outcome) = check.await else {
                continue;
            };
            attempted += 1;
            match outcome {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    debug!(asset, error = %e, "Transferability sub-check failed");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        // Every counted sub-check erroring means we learned nothing.
        match last_error {
            Some(e) if failures == attempted => {
                Err(e.context(format!("All transferability checks failed for {asset}")))
            }
            _ => Ok(false),
        }
    }

    async fn get_base_fee(&self) -> Result<u128> {
        self.quantity("eth_gasPrice", json!([]))
            .await
            .context("Failed to fetch gas price")
    }

    async fn estimate_transfer_gas(
        &self,
        asset: &str,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<u64> {
        let raw = abi::scale_up(amount, self.decimals(asset).await?)?;
        let gas = self
            .quantity(
                "eth_estimateGas",
                json!([{ "from": from, "to": asset, "data": Self::transfer_calldata(to, raw)? }]),
            )
            .await
            .context("eth_estimateGas failed")?;
        u64::try_from(gas).context("Gas estimate exceeds u64")
    }

    async fn submit_transfer(
        &self,
        credentials: &WalletCredentials,
        asset: &str,
        to: &str,
        amount: Decimal,
        fee_price: u128,
    ) -> Result<String> {
        let raw = abi::scale_up(amount, self.decimals(asset).await?)?;
        let gas = self
            .estimate_transfer_gas(asset, &credentials.address, to, amount)
            .await?;
        let gas_limit = gas + gas * GAS_LIMIT_BUFFER_PCT / 100;

        let result = self
            .rpc(
                &self.signer_url,
                "eth_sendTransaction",
                json!([{
                    "from": credentials.address,
                    "to": asset,
                    "data": Self::transfer_calldata(to, raw)?,
                    "gas": abi::to_quantity(gas_limit as u128),
                    "gasPrice": abi::to_quantity(fee_price),
                }]),
                Some(&credentials.secret),
            )
            .await?;

        let tx_hash = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("eth_sendTransaction returned no hash"))?;

        info!(asset, to, %amount, gas_limit, fee_price = %fee_price, tx_hash = %tx_hash, "Transfer submitted");
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>> {
        let result = self
            .rpc(
                &self.rpc_url,
                "eth_getTransactionReceipt",
                json!([tx_hash]),
                None,
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let receipt: RpcReceipt =
            serde_json::from_value(result).context("Failed to parse receipt")?;
        let Some(block) = receipt.block_number else {
            // Mined-but-pending receipts on some nodes carry no block yet.
            return Ok(None);
        };

        Ok(Some(Receipt {
            block_number: u64::try_from(abi::parse_quantity(&block)?)?,
            gas_used: u64::try_from(abi::parse_quantity(&receipt.gas_used)?)?,
            success: receipt.status.as_deref() == Some("0x1"),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
