//! Position sides, order sides and the trader's position snapshot entries.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which book of an instrument a quantity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionSide {
    /// Single net position; sign encodes direction
    #[serde(rename = "BOTH")]
    Merged,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Merged => "BOTH",
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// Direction of a signed merged amount. Zero has no direction.
    pub fn from_sign(amount: Decimal) -> Option<Self> {
        if amount > Decimal::ZERO {
            Some(PositionSide::Long)
        } else if amount < Decimal::ZERO {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    /// Order side that grows this book.
    pub fn opening_side(&self) -> Side {
        match self {
            PositionSide::Short => Side::Sell,
            PositionSide::Long | PositionSide::Merged => Side::Buy,
        }
    }

    /// Order side that shrinks this book.
    pub fn closing_side(&self) -> Side {
        self.opening_side().opposite()
    }

    pub fn is_dual(&self) -> bool {
        !matches!(self, PositionSide::Merged)
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BOTH" | "MERGED" | "SINGLE" => Ok(PositionSide::Merged),
            "LONG" | "DUAL_LONG" => Ok(PositionSide::Long),
            "SHORT" | "DUAL_SHORT" => Ok(PositionSide::Short),
            other => bail!("Unknown position side: {}", other),
        }
    }
}

/// Position mode configured on a follower's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    /// One net position per symbol
    Merged,
    /// Independent long and short books per symbol
    Dual,
}

impl PositionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionMode::Merged => "merged",
            PositionMode::Dual => "dual",
        }
    }

    /// Whether an intent or order addressed to `side` can be executed in this mode.
    pub fn accepts(&self, side: PositionSide) -> bool {
        match self {
            PositionMode::Merged => side == PositionSide::Merged,
            PositionMode::Dual => side.is_dual(),
        }
    }
}

impl fmt::Display for PositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "merged" | "both" | "one_way" | "single" => Ok(PositionMode::Merged),
            "dual" | "all" | "hedge" => Ok(PositionMode::Dual),
            other => bail!("Unknown position mode: {}", other),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => bail!("Unknown order side: {}", other),
        }
    }
}

/// One entry of the trader's position snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderPosition {
    pub symbol: String,

    pub side: PositionSide,

    /// Signed for `Merged`, non-negative magnitude for `Long`/`Short`
    pub amount: Decimal,
}

impl TraderPosition {
    pub fn new(symbol: impl Into<String>, side: PositionSide, amount: Decimal) -> Self {
        let amount = if side.is_dual() { amount.abs() } else { amount };
        Self {
            symbol: symbol.into(),
            side,
            amount,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.amount.is_zero()
    }
}
