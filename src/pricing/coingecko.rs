//! CoinGecko price source.
//!
//! API: `https://api.coingecko.com/api/v3/simple/token_price/{platform}`
//! and `/simple/price` for the native coin.
//! Auth: optional demo key via `x-cg-demo-api-key` header.
//! Rate limit: ~30 req/min on the free tier, hence the TTL cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::PriceSource;
use crate::config::{AppConfig, PricesConfig};
use crate::types::normalize_id;

const API_URL: &str = "https://api.coingecko.com/api/v3";

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    price: Option<Decimal>,
    inserted_at: chrono::DateTime<Utc>,
}

/// TTL cache keyed by asset id (or the native coin id). Unknown prices
/// are cached too so unpriced tokens don't burn the rate limit.
struct PriceCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl PriceCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Option<Decimal>> {
        self.entries.get(key).and_then(|entry| {
            if Utc::now() - entry.inserted_at < self.ttl {
                Some(entry.price)
            } else {
                None
            }
        })
    }

    fn insert(&mut self, key: String, price: Option<Decimal>) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.entries.retain(|_, e| now - e.inserted_at < ttl);
        self.entries.insert(
            key,
            CacheEntry {
                price,
                inserted_at: now,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct CoinGeckoPriceSource {
    http: Client,
    base_url: String,
    platform: String,
    native_id: String,
    native_override: Option<Decimal>,
    api_key: Option<String>,
    cache: RwLock<PriceCache>,
}

impl CoinGeckoPriceSource {
    pub fn new(config: &PricesConfig) -> Result<Self> {
        Self::with_base_url(config, API_URL)
    }

    pub fn with_base_url(config: &PricesConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build CoinGecko HTTP client")?;

        let api_key = match config.coingecko_api_key_env.as_deref() {
            Some(env) => match AppConfig::resolve_env(env) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "CoinGecko API key unavailable, using keyless tier");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            platform: config.coingecko_platform.clone(),
            native_id: config.coingecko_native_id.clone(),
            native_override: config.native_usd,
            api_key,
            cache: RwLock::new(PriceCache::new(Duration::seconds(config.cache_ttl_secs as i64))),
        })
    }

    /// Response shape: `{ "<id>": { "usd": 1.23 } }`.
    async fn fetch(&self, path: &str, query: &[(&str, &str)], key: &str) -> Result<Option<Decimal>> {
        let mut request = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query);
        if let Some(ref api_key) = self.api_key {
            request = request.header("x-cg-demo-api-key", api_key);
        }

        let resp = request.send().await.context("CoinGecko request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("CoinGecko API error {status}: {body}");
        }

        let body: HashMap<String, HashMap<String, Decimal>> = resp
            .json()
            .await
            .context("Failed to parse CoinGecko response")?;

        let price = body
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.get("usd").copied());
        debug!(key, price = ?price, "CoinGecko price fetched");
        Ok(price)
    }

    async fn cached(&self, key: &str) -> Option<Option<Decimal>> {
        self.cache.read().await.get(key)
    }
}

#[async_trait]
impl PriceSource for CoinGeckoPriceSource {
    async fn asset_usd(&self, asset: &str) -> Result<Option<Decimal>> {
        let Some(key) = normalize_id(asset) else {
            return Ok(None);
        };
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }

        let path = format!("/simple/token_price/{}", self.platform);
        let price = self
            .fetch(&path, &[("contract_addresses", &key), ("vs_currencies", "usd")], &key)
            .await;
        match price {
            Ok(price) => {
                self.cache.write().await.insert(key, price);
                Ok(price)
            }
            Err(e) => {
                warn!(asset = %key, error = %e, "Token price lookup failed");
                Err(e)
            }
        }
    }

    async fn native_usd(&self) -> Result<Option<Decimal>> {
        if self.native_override.is_some() {
            return Ok(self.native_override);
        }
        let key = self.native_id.clone();
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }
        let price = self
            .fetch("/simple/price", &[("ids", &key), ("vs_currencies", "usd")], &key)
            .await?;
        self.cache.write().await.insert(key, price);
        Ok(price)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
