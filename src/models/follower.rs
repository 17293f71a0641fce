//! Follower accounts and their credentials.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionMode;

/// Derivatives venue a follower trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Binance,
    Gate,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Binance => "binance",
            Platform::Gate => "gate",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Platform::Binance),
            "gate" | "gateio" => Ok(Platform::Gate),
            other => bail!("Unknown platform: {}", other),
        }
    }
}

/// Whether a follower may take on new exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enablement {
    Active,
    /// Closes still flow, opens and adds are skipped
    Paused,
}

impl Enablement {
    /// Store encoding: 2 = active, anything else = paused.
    pub fn from_open_status(status: i64) -> Self {
        if status == 2 {
            Enablement::Active
        } else {
            Enablement::Paused
        }
    }

    pub fn open_status(&self) -> i64 {
        match self {
            Enablement::Active => 2,
            Enablement::Paused => 1,
        }
    }
}

/// Lifecycle state of a follower's API binding in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Enabled,
    Disabled,
    Pending,
}

impl ApiStatus {
    pub fn code(&self) -> i64 {
        match self {
            ApiStatus::Enabled => 1,
            ApiStatus::Disabled => 2,
            ApiStatus::Pending => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ApiStatus::Enabled),
            2 => Ok(ApiStatus::Disabled),
            3 => Ok(ApiStatus::Pending),
            other => bail!("Unknown api status: {}", other),
        }
    }

    /// Counted against the follower capacity.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, ApiStatus::Enabled | ApiStatus::Pending)
    }
}

/// API key pair used to act on an exchange account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Load from `<PREFIX>_API_KEY` / `<PREFIX>_API_SECRET`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        use anyhow::Context;

        let key_var = format!("{}_API_KEY", prefix);
        let secret_var = format!("{}_API_SECRET", prefix);
        let api_key = std::env::var(&key_var).with_context(|| format!("{} not set", key_var))?;
        let api_secret =
            std::env::var(&secret_var).with_context(|| format!("{} not set", secret_var))?;

        Ok(Self::new(api_key, api_secret))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

/// Show only the first and last four characters of a key.
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// An account receiving proportionally sized replica orders.
#[derive(Debug, Clone, PartialEq)]
pub struct Follower {
    /// Store identifier
    pub id: i64,

    /// Free-form owner reference (wallet or user handle)
    pub address: String,

    pub platform: Platform,

    pub credentials: Credentials,

    /// Multiplier applied to the account equity before sizing (> 0)
    pub equity_ratio: Decimal,

    pub enablement: Enablement,

    /// Mirror the trader's current positions once when admitted
    pub needs_bootstrap: bool,

    pub position_mode: PositionMode,
}

impl Follower {
    pub fn is_active(&self) -> bool {
        self.enablement == Enablement::Active
    }
}
