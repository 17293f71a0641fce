//! SQLite store for the follower roster and symbol metadata.
//!
//! Holds what the engine reloads on every sync pass:
//! - Followers with credentials, status codes, ratio and position mode
//! - Symbol precision and contract size per platform

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::warn;

use crate::models::{
    ApiStatus, Credentials, Enablement, Follower, Platform, PositionMode, SymbolInfo,
};

/// Store operations the replication core depends on.
#[async_trait]
pub trait FollowerStore: Send + Sync {
    /// Followers with an enabled API binding.
    async fn list_active_followers(&self) -> Result<Vec<Follower>>;

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>>;

    async fn update_follower(&self, id: i64, update: &FollowerUpdate) -> Result<()>;
}

/// Partial follower update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowerUpdate {
    pub api_status: Option<ApiStatus>,
    pub enablement: Option<Enablement>,
    pub equity_ratio: Option<Decimal>,
    pub needs_bootstrap: Option<bool>,
    pub position_mode: Option<PositionMode>,
}

/// Follower to be inserted.
#[derive(Debug, Clone)]
pub struct NewFollower {
    pub address: String,
    pub platform: Platform,
    pub credentials: Credentials,
    pub equity_ratio: Decimal,
    pub needs_bootstrap: bool,
    pub position_mode: PositionMode,
}

/// Stored follower record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredFollower {
    pub id: i64,
    pub address: String,
    pub platform: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_status: i64,
    pub open_status: i64,
    pub need_init: i64,
    pub equity_ratio: String,
    pub position_mode: String,
}

impl StoredFollower {
    pub fn status(&self) -> Result<ApiStatus> {
        ApiStatus::from_code(self.api_status)
    }

    pub fn into_follower(self) -> Result<Follower> {
        Ok(Follower {
            id: self.id,
            platform: self.platform.parse()?,
            credentials: Credentials::new(self.api_key, self.api_secret),
            equity_ratio: Decimal::from_str(&self.equity_ratio)
                .with_context(|| format!("Bad equity ratio for follower {}", self.id))?,
            enablement: Enablement::from_open_status(self.open_status),
            needs_bootstrap: self.need_init == 1,
            position_mode: self.position_mode.parse()?,
            address: self.address,
        })
    }
}

/// Stored symbol record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSymbol {
    pub platform: String,
    pub symbol: String,
    pub coin: String,
    pub quantity_precision: i64,
    pub price_precision: i64,
    pub contract_multiplier: String,
}

impl StoredSymbol {
    pub fn into_symbol(self) -> Result<SymbolInfo> {
        Ok(SymbolInfo {
            platform: self.platform.parse()?,
            quantity_precision: u32::try_from(self.quantity_precision)
                .with_context(|| format!("Bad precision for {}", self.symbol))?,
            contract_multiplier: Decimal::from_str(&self.contract_multiplier)
                .with_context(|| format!("Bad contract multiplier for {}", self.symbol))?,
            symbol: self.symbol,
            coin: self.coin,
        })
    }
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database on a single connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS followers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                platform TEXT NOT NULL,
                api_key TEXT NOT NULL UNIQUE,
                api_secret TEXT NOT NULL,
                api_status INTEGER NOT NULL DEFAULT 1,
                open_status INTEGER NOT NULL DEFAULT 2,
                need_init INTEGER NOT NULL DEFAULT 0,
                equity_ratio TEXT NOT NULL DEFAULT '1',
                position_mode TEXT NOT NULL DEFAULT 'merged',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbols (
                platform TEXT NOT NULL,
                symbol TEXT NOT NULL,
                coin TEXT NOT NULL,
                quantity_precision INTEGER NOT NULL DEFAULT 0,
                price_precision INTEGER NOT NULL DEFAULT 0,
                contract_multiplier TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (platform, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_followers_status ON followers(api_status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Followers ====================

    /// Insert an enabled, active follower and return its id.
    pub async fn insert_follower(&self, follower: &NewFollower) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO followers (
                address, platform, api_key, api_secret, api_status, open_status,
                need_init, equity_ratio, position_mode
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follower.address)
        .bind(follower.platform.as_str())
        .bind(&follower.credentials.api_key)
        .bind(&follower.credentials.api_secret)
        .bind(ApiStatus::Enabled.code())
        .bind(Enablement::Active.open_status())
        .bind(follower.needs_bootstrap as i64)
        .bind(follower.equity_ratio.to_string())
        .bind(follower.position_mode.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to insert follower")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_follower(&self, id: i64) -> Result<Option<StoredFollower>> {
        sqlx::query_as::<_, StoredFollower>("SELECT * FROM followers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch follower")
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<StoredFollower>> {
        sqlx::query_as::<_, StoredFollower>("SELECT * FROM followers WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up follower")
    }

    /// Every follower regardless of status, by id.
    pub async fn list_followers(&self) -> Result<Vec<StoredFollower>> {
        sqlx::query_as::<_, StoredFollower>("SELECT * FROM followers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch followers")
    }

    /// Followers counted against the capacity (enabled or pending).
    pub async fn count_occupying(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM followers WHERE api_status IN (?, ?)")
                .bind(ApiStatus::Enabled.code())
                .bind(ApiStatus::Pending.code())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // ==================== Symbols ====================

    pub async fn upsert_symbol(&self, info: &SymbolInfo, price_precision: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO symbols (platform, symbol, coin, quantity_precision, price_precision, contract_multiplier)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, symbol) DO UPDATE SET
                coin = excluded.coin,
                quantity_precision = excluded.quantity_precision,
                price_precision = excluded.price_precision,
                contract_multiplier = excluded.contract_multiplier,
                updated_at = datetime('now')
            "#,
        )
        .bind(info.platform.as_str())
        .bind(&info.symbol)
        .bind(&info.coin)
        .bind(i64::from(info.quantity_precision))
        .bind(i64::from(price_precision))
        .bind(info.contract_multiplier.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_symbols(&self, platform: Option<Platform>) -> Result<Vec<StoredSymbol>> {
        let rows = match platform {
            Some(platform) => {
                sqlx::query_as::<_, StoredSymbol>(
                    "SELECT * FROM symbols WHERE platform = ? ORDER BY symbol",
                )
                .bind(platform.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredSymbol>("SELECT * FROM symbols ORDER BY platform, symbol")
                    .fetch_all(&self.pool)
                    .await
            }
        };
        rows.context("Failed to fetch symbols")
    }
}

#[async_trait]
impl FollowerStore for Database {
    async fn list_active_followers(&self) -> Result<Vec<Follower>> {
        let rows = sqlx::query_as::<_, StoredFollower>(
            "SELECT * FROM followers WHERE api_status = ? ORDER BY id",
        )
        .bind(ApiStatus::Enabled.code())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active followers")?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match row.into_follower() {
                    Ok(follower) => Some(follower),
                    Err(e) => {
                        warn!(follower = id, error = %e, "Skipping malformed follower row");
                        None
                    }
                }
            })
            .collect())
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>> {
        Ok(self
            .get_symbols(None)
            .await?
            .into_iter()
            .filter_map(|row| {
                let symbol = row.symbol.clone();
                match row.into_symbol() {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Skipping malformed symbol row");
                        None
                    }
                }
            })
            .collect())
    }

    async fn update_follower(&self, id: i64, update: &FollowerUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE followers SET
                api_status = COALESCE(?, api_status),
                open_status = COALESCE(?, open_status),
                equity_ratio = COALESCE(?, equity_ratio),
                need_init = COALESCE(?, need_init),
                position_mode = COALESCE(?, position_mode),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(update.api_status.map(|s| s.code()))
        .bind(update.enablement.map(|e| e.open_status()))
        .bind(update.equity_ratio.map(|r| r.to_string()))
        .bind(update.needs_bootstrap.map(|b| b as i64))
        .bind(update.position_mode.map(|m| m.as_str()))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update follower")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Follower {} not found", id);
        }
        Ok(())
    }
}
