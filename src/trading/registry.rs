//! Symbol registry keyed by platform and symbol.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::models::{Platform, SymbolInfo};

/// Read-mostly lookup of instrument metadata.
#[derive(Default)]
pub struct SymbolRegistry {
    symbols: RwLock<HashMap<(Platform, String), SymbolInfo>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, platform: Platform, symbol: &str) -> Option<SymbolInfo> {
        self.symbols
            .read()
            .await
            .get(&(platform, symbol.to_string()))
            .cloned()
    }

    /// Replace the whole registry with a fresh listing.
    pub async fn replace(&self, listing: Vec<SymbolInfo>) -> usize {
        let fresh: HashMap<_, _> = listing
            .into_iter()
            .map(|info| ((info.platform, info.symbol.clone()), info))
            .collect();
        let count = fresh.len();
        *self.symbols.write().await = fresh;
        count
    }

    pub async fn len(&self) -> usize {
        self.symbols.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_replace_and_lookup() {
        let registry = SymbolRegistry::new();
        let listing = vec![
            SymbolInfo {
                platform: Platform::Binance,
                symbol: "BTCUSDT".to_string(),
                coin: "BTC".to_string(),
                quantity_precision: 3,
                contract_multiplier: dec!(0),
            },
            SymbolInfo {
                platform: Platform::Gate,
                symbol: "BTCUSDT".to_string(),
                coin: "BTC".to_string(),
                quantity_precision: 0,
                contract_multiplier: dec!(0.0001),
            },
        ];

        assert_eq!(registry.replace(listing).await, 2);
        let gate = registry.get(Platform::Gate, "BTCUSDT").await.unwrap();
        assert_eq!(gate.contract_multiplier, dec!(0.0001));
        assert!(registry.get(Platform::Binance, "ETHUSDT").await.is_none());

        registry.replace(Vec::new()).await;
        assert_eq!(registry.len().await, 0);
    }
}
