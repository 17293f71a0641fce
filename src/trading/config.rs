//! Replication configuration.

use std::str::FromStr;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Where the trader's sizing equity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraderEquitySource {
    /// Futures account margin balance
    Futures,
    /// Every wallet of the account, valued in USDT
    Wallet,
}

impl FromStr for TraderEquitySource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "futures" => Ok(TraderEquitySource::Futures),
            "wallet" => Ok(TraderEquitySource::Wallet),
            other => bail!("Unknown trader equity source: {}", other),
        }
    }
}

/// Configuration for sizing, ledger arithmetic and follower limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Quantities at or below this magnitude are treated as zero
    pub epsilon: Decimal,

    /// Equity changes smaller than this are not applied
    pub equity_tolerance: Decimal,

    /// Maximum number of enabled or pending followers
    pub follower_capacity: i64,

    /// Pause between followers while force-flattening a platform (ms)
    pub flatten_pause_ms: u64,

    /// Source of the trader's equity
    pub trader_equity_source: TraderEquitySource,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            epsilon: dec!(0.0000001),
            equity_tolerance: dec!(100),
            follower_capacity: 35,
            flatten_pause_ms: 500,
            trader_equity_source: TraderEquitySource::Futures,
        }
    }
}

impl ReplicationConfig {
    /// Overlay `COPIER_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("COPIER_EPSILON") {
            config.epsilon = Decimal::from_str(&v)?;
        }
        if let Ok(v) = std::env::var("COPIER_EQUITY_TOLERANCE") {
            config.equity_tolerance = Decimal::from_str(&v)?;
        }
        if let Ok(v) = std::env::var("COPIER_FOLLOWER_CAPACITY") {
            config.follower_capacity = v.parse()?;
        }
        if let Ok(v) = std::env::var("COPIER_TRADER_EQUITY") {
            config.trader_equity_source = v.parse()?;
        }

        Ok(config)
    }
}
