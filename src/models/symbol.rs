//! Tradable instrument metadata.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Platform;

/// Precision and contract size of one instrument on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub platform: Platform,

    /// Canonical symbol as the trader's venue reports it (e.g. "BTCUSDT")
    pub symbol: String,

    /// Base coin (e.g. "BTC")
    pub coin: String,

    /// Decimal places accepted for order quantities
    pub quantity_precision: u32,

    /// Coins per contract; only meaningful on contract-denominated venues
    pub contract_multiplier: Decimal,
}

impl SymbolInfo {
    /// Instrument name in the platform's own notation.
    pub fn venue_symbol(&self) -> String {
        match self.platform {
            Platform::Binance => self.symbol.clone(),
            Platform::Gate => format!("{}_USDT", self.coin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_venue_symbol() {
        let mut info = SymbolInfo {
            platform: Platform::Binance,
            symbol: "ETHUSDT".to_string(),
            coin: "ETH".to_string(),
            quantity_precision: 3,
            contract_multiplier: dec!(0.01),
        };
        assert_eq!(info.venue_symbol(), "ETHUSDT");

        info.platform = Platform::Gate;
        assert_eq!(info.venue_symbol(), "ETH_USDT");
    }
}
