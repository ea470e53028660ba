//! SQLite store.
//!
//! Tables are created on open with `CREATE TABLE IF NOT EXISTS`; there is
//! no migration framework. Decimals, wei amounts, and timestamps are
//! stored as TEXT (timestamps in RFC 3339) so no precision is lost.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::SweepStore;
use crate::types::{
    ActivityRecord, AssetDetection, CongestionLevel, NetworkStatus, SweepAttempt, SweepStatus,
    WalletConfig,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS wallets (
        address          TEXT PRIMARY KEY,
        safe_address     TEXT NOT NULL,
        fee_strategy     TEXT NOT NULL,
        min_transfer_usd TEXT NOT NULL,
        auto_sweep       BOOLEAN NOT NULL,
        active           BOOLEAN NOT NULL,
        credential_env   TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS transactions (
        id           TEXT PRIMARY KEY,
        wallet       TEXT NOT NULL,
        asset        TEXT NOT NULL,
        symbol       TEXT NOT NULL,
        amount       TEXT NOT NULL,
        value_usd    TEXT,
        status       TEXT NOT NULL,
        fee_price    TEXT NOT NULL,
        tx_hash      TEXT,
        block_number INTEGER,
        gas_used     INTEGER,
        error        TEXT,
        created_at   TEXT NOT NULL,
        completed_at TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_transactions_wallet ON transactions (wallet, status)",
    r"
    CREATE TABLE IF NOT EXISTS detections (
        id           TEXT PRIMARY KEY,
        wallet       TEXT NOT NULL,
        asset        TEXT NOT NULL,
        name         TEXT NOT NULL,
        symbol       TEXT NOT NULL,
        decimals     INTEGER NOT NULL,
        balance      TEXT NOT NULL,
        value_usd    TEXT,
        transferable BOOLEAN NOT NULL,
        detected_at  TEXT NOT NULL,
        last_checked TEXT NOT NULL,
        UNIQUE (wallet, asset)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS activity (
        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
        id         TEXT NOT NULL UNIQUE,
        wallet     TEXT NOT NULL,
        asset      TEXT,
        kind       TEXT NOT NULL,
        message    TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS network_status (
        id         INTEGER PRIMARY KEY CHECK (id = 1),
        base_fee   TEXT NOT NULL,
        congestion TEXT NOT NULL,
        sampled_at TEXT NOT NULL
    )
    ",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url`, creating the file and tables if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid SQLite URL: {database_url}"))?
            .create_if_missing(true);

        // Every connection to `:memory:` is its own database, so keep one
        // connection alive for the lifetime of the pool.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database {database_url}"))?;

        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&pool)
                .await
                .context("Failed to create schema")?;
        }

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

fn decimal(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).with_context(|| format!("Bad decimal in {col}: {raw}"))
}

fn opt_decimal(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| Decimal::from_str(&s).with_context(|| format!("Bad decimal in {col}: {s}")))
        .transpose()
}

fn wei(row: &SqliteRow, col: &str) -> Result<u128> {
    let raw: String = row.try_get(col)?;
    raw.parse::<u128>()
        .with_context(|| format!("Bad integer in {col}: {raw}"))
}

fn timestamp(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_time(col, &raw)
}

fn opt_timestamp(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| parse_time(col, &s)).transpose()
}

fn parse_time(col: &str, raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp in {col}: {raw}"))?
        .with_timezone(&Utc))
}

fn opt_u64(row: &SqliteRow, col: &str) -> Result<Option<u64>> {
    let raw: Option<i64> = row.try_get(col)?;
    Ok(raw.map(|v| v as u64))
}

fn wallet_from_row(row: &SqliteRow) -> Result<WalletConfig> {
    Ok(WalletConfig {
        address: row.try_get("address")?,
        safe_address: row.try_get("safe_address")?,
        fee_strategy: row.try_get("fee_strategy")?,
        min_transfer_usd: decimal(row, "min_transfer_usd")?,
        auto_sweep: row.try_get("auto_sweep")?,
        active: row.try_get("active")?,
        credential_env: row.try_get("credential_env")?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<SweepAttempt> {
    let status: String = row.try_get("status")?;
    Ok(SweepAttempt {
        id: row.try_get("id")?,
        wallet: row.try_get("wallet")?,
        asset: row.try_get("asset")?,
        symbol: row.try_get("symbol")?,
        amount: decimal(row, "amount")?,
        value_usd: opt_decimal(row, "value_usd")?,
        status: status.parse::<SweepStatus>()?,
        fee_price: wei(row, "fee_price")?,
        tx_hash: row.try_get("tx_hash")?,
        block_number: opt_u64(row, "block_number")?,
        gas_used: opt_u64(row, "gas_used")?,
        error: row.try_get("error")?,
        created_at: timestamp(row, "created_at")?,
        completed_at: opt_timestamp(row, "completed_at")?,
    })
}

fn detection_from_row(row: &SqliteRow) -> Result<AssetDetection> {
    let decimals: i64 = row.try_get("decimals")?;
    Ok(AssetDetection {
        id: row.try_get("id")?,
        wallet: row.try_get("wallet")?,
        asset: row.try_get("asset")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        decimals: u8::try_from(decimals).context("decimals out of range")?,
        balance: decimal(row, "balance")?,
        value_usd: opt_decimal(row, "value_usd")?,
        transferable: row.try_get("transferable")?,
        detected_at: timestamp(row, "detected_at")?,
        last_checked: timestamp(row, "last_checked")?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityRecord> {
    let kind: String = row.try_get("kind")?;
    Ok(ActivityRecord {
        id: row.try_get("id")?,
        wallet: row.try_get("wallet")?,
        asset: row.try_get("asset")?,
        kind: kind.parse()?,
        message: row.try_get("message")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn ensure_updated(rows: u64, what: &str, id: &str) -> Result<()> {
    if rows == 0 {
        bail!("{what} {id} not found");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SweepStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SweepStore for SqliteStore {
    async fn get_wallet(&self, address: &str) -> Result<Option<WalletConfig>> {
        sqlx::query("SELECT * FROM wallets WHERE address = ?1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(wallet_from_row)
            .transpose()
    }

    async fn create_wallet(&self, wallet: &WalletConfig) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO wallets
                (address, safe_address, fee_strategy, min_transfer_usd, auto_sweep, active, credential_env)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(&wallet.address)
        .bind(&wallet.safe_address)
        .bind(&wallet.fee_strategy)
        .bind(wallet.min_transfer_usd.to_string())
        .bind(wallet.auto_sweep)
        .bind(wallet.active)
        .bind(&wallet.credential_env)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create wallet {}", wallet.address))?;
        Ok(())
    }

    async fn update_wallet(&self, wallet: &WalletConfig) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE wallets SET
                safe_address = ?2, fee_strategy = ?3, min_transfer_usd = ?4,
                auto_sweep = ?5, active = ?6, credential_env = ?7
            WHERE address = ?1
            ",
        )
        .bind(&wallet.address)
        .bind(&wallet.safe_address)
        .bind(&wallet.fee_strategy)
        .bind(wallet.min_transfer_usd.to_string())
        .bind(wallet.auto_sweep)
        .bind(wallet.active)
        .bind(&wallet.credential_env)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), "Wallet", &wallet.address)
    }

    async fn list_wallets(&self) -> Result<Vec<WalletConfig>> {
        sqlx::query("SELECT * FROM wallets ORDER BY address")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(wallet_from_row)
            .collect()
    }

    async fn create_transaction(&self, attempt: &SweepAttempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO transactions
                (id, wallet, asset, symbol, amount, value_usd, status, fee_price,
                 tx_hash, block_number, gas_used, error, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
        )
        .bind(&attempt.id)
        .bind(&attempt.wallet)
        .bind(&attempt.asset)
        .bind(&attempt.symbol)
        .bind(attempt.amount.to_string())
        .bind(attempt.value_usd.map(|v| v.to_string()))
        .bind(attempt.status.to_string())
        .bind(attempt.fee_price.to_string())
        .bind(&attempt.tx_hash)
        .bind(attempt.block_number.map(|b| b as i64))
        .bind(attempt.gas_used.map(|g| g as i64))
        .bind(&attempt.error)
        .bind(attempt.created_at.to_rfc3339())
        .bind(attempt.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create transaction {}", attempt.id))?;
        Ok(())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<SweepAttempt>> {
        sqlx::query("SELECT * FROM transactions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(attempt_from_row)
            .transpose()
    }

    async fn update_transaction(&self, attempt: &SweepAttempt) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE transactions SET
                status = ?2, tx_hash = ?3, block_number = ?4, gas_used = ?5,
                error = ?6, completed_at = ?7
            WHERE id = ?1
            ",
        )
        .bind(&attempt.id)
        .bind(attempt.status.to_string())
        .bind(&attempt.tx_hash)
        .bind(attempt.block_number.map(|b| b as i64))
        .bind(attempt.gas_used.map(|g| g as i64))
        .bind(&attempt.error)
        .bind(attempt.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), "Transaction", &attempt.id)
    }

    async fn list_transactions(
        &self,
        wallet: &str,
        status: Option<SweepStatus>,
    ) -> Result<Vec<SweepAttempt>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM transactions WHERE wallet = ?1 AND status = ?2 ORDER BY created_at DESC",
                )
                .bind(wallet)
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transactions WHERE wallet = ?1 ORDER BY created_at DESC")
                    .bind(wallet)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(attempt_from_row).collect()
    }

    async fn create_detection(&self, detection: &AssetDetection) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO detections
                (id, wallet, asset, name, symbol, decimals, balance, value_usd,
                 transferable, detected_at, last_checked)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
        )
        .bind(&detection.id)
        .bind(&detection.wallet)
        .bind(&detection.asset)
        .bind(&detection.name)
        .bind(&detection.symbol)
        .bind(detection.decimals as i64)
        .bind(detection.balance.to_string())
        .bind(detection.value_usd.map(|v| v.to_string()))
        .bind(detection.transferable)
        .bind(detection.detected_at.to_rfc3339())
        .bind(detection.last_checked.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to create detection for {} in {}",
                detection.asset, detection.wallet
            )
        })?;
        Ok(())
    }

    async fn get_detection(&self, id: &str) -> Result<Option<AssetDetection>> {
        sqlx::query("SELECT * FROM detections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(detection_from_row)
            .transpose()
    }

    async fn find_detection(&self, wallet: &str, asset: &str) -> Result<Option<AssetDetection>> {
        sqlx::query("SELECT * FROM detections WHERE wallet = ?1 AND asset = ?2")
            .bind(wallet)
            .bind(asset)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(detection_from_row)
            .transpose()
    }

    async fn list_detections(&self, wallet: &str) -> Result<Vec<AssetDetection>> {
        sqlx::query("SELECT * FROM detections WHERE wallet = ?1 ORDER BY detected_at")
            .bind(wallet)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(detection_from_row)
            .collect()
    }

    async fn update_detection(&self, detection: &AssetDetection) -> Result<()> {
        // The transferable flag only ever moves forward.
        let result = sqlx::query(
            r"
            UPDATE detections SET
                name = ?2, symbol = ?3, decimals = ?4, balance = ?5, value_usd = ?6,
                transferable = (transferable OR ?7), last_checked = ?8
            WHERE id = ?1
            ",
        )
        .bind(&detection.id)
        .bind(&detection.name)
        .bind(&detection.symbol)
        .bind(detection.decimals as i64)
        .bind(detection.balance.to_string())
        .bind(detection.value_usd.map(|v| v.to_string()))
        .bind(detection.transferable)
        .bind(detection.last_checked.to_rfc3339())
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), "Detection", &detection.id)
    }

    async fn mark_transferable(&self, wallet: &str, asset: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE detections SET transferable = 1 WHERE wallet = ?1 AND asset = ?2 AND transferable = 0",
        )
        .bind(wallet)
        .bind(asset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.find_detection(wallet, asset).await?.is_none() {
            bail!("No detection for {asset} in wallet {wallet}");
        }
        Ok(false)
    }

    async fn append_activity(&self, record: &ActivityRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO activity (id, wallet, asset, kind, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(&record.id)
        .bind(&record.wallet)
        .bind(&record.asset)
        .bind(record.kind.to_string())
        .bind(&record.message)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to append activity")?;
        Ok(())
    }

    async fn list_activity(&self, wallet: Option<&str>, limit: usize) -> Result<Vec<ActivityRecord>> {
        let limit = limit as i64;
        let rows = match wallet {
            Some(wallet) => {
                sqlx::query("SELECT * FROM activity WHERE wallet = ?1 ORDER BY seq DESC LIMIT ?2")
                    .bind(wallet)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM activity ORDER BY seq DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(activity_from_row).collect()
    }

    async fn get_network_status(&self) -> Result<Option<NetworkStatus>> {
        let Some(row) = sqlx::query("SELECT * FROM network_status WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let congestion: String = row.try_get("congestion")?;
        Ok(Some(NetworkStatus {
            base_fee: wei(&row, "base_fee")?,
            congestion: CongestionLevel::from_str(&congestion)?,
            sampled_at: timestamp(&row, "sampled_at")?,
        }))
    }

    async fn update_network_status(&self, status: &NetworkStatus) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO network_status (id, base_fee, congestion, sampled_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                base_fee = excluded.base_fee,
                congestion = excluded.congestion,
                sampled_at = excluded.sampled_at
            ",
        )
        .bind(status.base_fee.to_string())
        .bind(status.congestion.to_string())
        .bind(status.sampled_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
