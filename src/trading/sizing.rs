//! Order sizing and platform quantization.
//!
//! Quantities come out in venue units: coins on Binance, whole contracts on
//! Gate. Ledger entries are kept in the same units, so a full close is
//! always exactly the ledger magnitude. Rounding is midpoint away from zero
//! on every platform.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{Platform, SymbolInfo};

/// Sizing calculator bound to one epsilon.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    epsilon: Decimal,
}

impl PositionSizer {
    pub fn new(epsilon: Decimal) -> Self {
        Self { epsilon }
    }

    /// Size of an open or add: the trader's delta scaled by the equity ratio.
    ///
    /// Returns zero when either equity is not positive.
    pub fn open_quantity(
        &self,
        trader_qty: Decimal,
        follower_equity: Decimal,
        trader_equity: Decimal,
        symbol: &SymbolInfo,
    ) -> Decimal {
        if follower_equity <= Decimal::ZERO || trader_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let coins = trader_qty.abs() * follower_equity / trader_equity;
        self.coins_to_units(coins, symbol)
    }

    /// Size of a partial close: the trader's close fraction applied to the
    /// follower's own tracked position.
    ///
    /// Returns zero when the trader's prior magnitude is not positive.
    pub fn reduce_quantity(
        &self,
        ledger_magnitude: Decimal,
        trader_qty: Decimal,
        trader_prior: Decimal,
        symbol: &SymbolInfo,
    ) -> Decimal {
        if trader_prior <= self.epsilon {
            return Decimal::ZERO;
        }
        let units = ledger_magnitude.abs() * trader_qty.abs() / trader_prior;
        self.round_units(units, symbol)
    }

    /// Convert a coin quantity to venue units.
    pub fn coins_to_units(&self, coins: Decimal, symbol: &SymbolInfo) -> Decimal {
        match symbol.platform {
            Platform::Binance => self.round_units(coins, symbol),
            Platform::Gate => {
                if symbol.contract_multiplier <= Decimal::ZERO {
                    return Decimal::ZERO;
                }
                self.round_units(coins / symbol.contract_multiplier, symbol)
            }
        }
    }

    /// Round a quantity that is already in venue units.
    pub fn round_units(&self, units: Decimal, symbol: &SymbolInfo) -> Decimal {
        let dp = match symbol.platform {
            Platform::Binance => symbol.quantity_precision,
            Platform::Gate => 0,
        };
        units
            .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }

    /// Below the minimum lot after quantization.
    pub fn is_dust(&self, quantity: Decimal) -> bool {
        quantity.abs() <= self.epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn binance(precision: u32) -> SymbolInfo {
        SymbolInfo {
            platform: Platform::Binance,
            symbol: "BTCUSDT".to_string(),
            coin: "BTC".to_string(),
            quantity_precision: precision,
            contract_multiplier: Decimal::ZERO,
        }
    }

    fn gate(multiplier: Decimal) -> SymbolInfo {
        SymbolInfo {
            platform: Platform::Gate,
            symbol: "BTCUSDT".to_string(),
            coin: "BTC".to_string(),
            quantity_precision: 0,
            contract_multiplier: multiplier,
        }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(dec!(0.0000001))
    }

    #[test]
    fn test_open_scales_by_equity() {
        let qty = sizer().open_quantity(dec!(10), dec!(100), dec!(1000), &binance(0));
        assert_eq!(qty, dec!(1));

        let qty = sizer().open_quantity(dec!(0.5), dec!(333), dec!(1000), &binance(3));
        assert_eq!(qty, dec!(0.167));
    }

    #[test]
    fn test_open_requires_positive_equity() {
        assert!(sizer().open_quantity(dec!(10), dec!(0), dec!(1000), &binance(0)).is_zero());
        assert!(sizer().open_quantity(dec!(10), dec!(100), dec!(-1), &binance(0)).is_zero());
    }

    #[test]
    fn test_reduce_is_fraction_of_ledger() {
        // 1 * 6 / 10 = 0.6 -> 1 at precision 0
        let qty = sizer().reduce_quantity(dec!(1), dec!(6), dec!(10), &binance(0));
        assert_eq!(qty, dec!(1));

        let qty = sizer().reduce_quantity(dec!(1), dec!(6), dec!(10), &binance(1));
        assert_eq!(qty, dec!(0.6));

        assert!(sizer().reduce_quantity(dec!(1), dec!(6), dec!(0), &binance(1)).is_zero());
    }

    #[test]
    fn test_midpoint_rounds_away_from_zero() {
        assert_eq!(sizer().round_units(dec!(0.5), &binance(0)), dec!(1));
        assert_eq!(sizer().round_units(dec!(0.49), &binance(0)), dec!(0));
        assert_eq!(sizer().round_units(dec!(0.125), &binance(2)), dec!(0.13));
        assert_eq!(sizer().round_units(dec!(2.5), &gate(dec!(1))), dec!(3));
    }

    #[test]
    fn test_gate_converts_to_contracts() {
        // 0.0234 BTC at 0.001 BTC/contract -> 23 contracts
        let units = sizer().coins_to_units(dec!(0.0234), &gate(dec!(0.001)));
        assert_eq!(units, dec!(23));

        // Unknown multiplier never produces an order
        assert!(sizer().coins_to_units(dec!(5), &gate(Decimal::ZERO)).is_zero());
    }

    #[test]
    fn test_quantized_nonzero_never_rounds_to_zero() {
        let s = sizer();
        let symbols = [binance(0), binance(2), binance(3), gate(dec!(0.01)), gate(dec!(10))];
        let inputs = [dec!(0.001), dec!(0.004), dec!(0.005), dec!(0.3), dec!(0.6), dec!(4.9), dec!(12)];

        for symbol in &symbols {
            for input in inputs {
                let q = s.coins_to_units(input, symbol);
                // Either skipped as dust or a real quantity at the venue's precision
                if !s.is_dust(q) {
                    assert!(q > Decimal::ZERO);
                    assert_eq!(q, s.round_units(q, symbol));
                } else {
                    assert!(q.is_zero());
                }
            }
        }
    }
}
