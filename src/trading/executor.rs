//! Replication executor: turns an intent into one follower order.
//!
//! [`ReplicationExecutor::plan`] is pure: it checks the preconditions,
//! sizes and quantizes the order and says how the ledger moves if the order
//! succeeds. [`ReplicationExecutor::execute`] submits the plan and touches
//! the ledger only after the venue accepted the order.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{ExchangePosition, Exchanges, OrderAck, OrderRequest};
use crate::models::{Follower, Intent, IntentKind, PositionMode, PositionSide, Side, SymbolInfo};

use super::equity::EquityBook;
use super::ledger::FollowerBook;
use super::registry::SymbolRegistry;
use super::sizing::PositionSizer;

/// Why an intent produced no order.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    ModeMismatch {
        mode: PositionMode,
        side: PositionSide,
    },
    TraderEquityUnavailable,
    FollowerEquityUnavailable,
    /// New exposure for a paused follower
    Paused,
    UnknownSymbol,
    /// Reduce or close with nothing in the ledger
    NothingToClose,
    /// Quantized to below the minimum lot
    Dust,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ModeMismatch { mode, side } => {
                write!(f, "{} intent for a {} follower", side, mode)
            }
            SkipReason::TraderEquityUnavailable => f.write_str("trader equity not positive"),
            SkipReason::FollowerEquityUnavailable => f.write_str("follower equity not positive"),
            SkipReason::Paused => f.write_str("follower paused"),
            SkipReason::UnknownSymbol => f.write_str("no symbol metadata"),
            SkipReason::NothingToClose => f.write_str("nothing tracked to close"),
            SkipReason::Dust => f.write_str("quantity below minimum lot"),
        }
    }
}

/// How the ledger moves once an order is confirmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LedgerChange {
    Apply(Decimal),
    /// Set to exactly zero
    Flatten,
}

/// Order plus its ledger consequence.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub order: OrderRequest,
    pub ledger_side: PositionSide,
    pub change: LedgerChange,
}

/// Inputs of one planning decision.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub symbol: Option<&'a SymbolInfo>,
    pub trader_equity: Decimal,
    /// Exchange equity already scaled by the follower's ratio
    pub follower_equity: Decimal,
    /// Ledger entry for the intent's symbol and side
    pub ledger: Decimal,
}

/// Result of executing one intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Placed {
        order_id: i64,
        quantity: Decimal,
        ledger: Decimal,
    },
    Skipped(SkipReason),
}

/// Size of an operator order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualSize {
    Coins(Decimal),
    /// Whatever the exchange reports as open on that side
    CloseAll,
}

/// Operator order for one follower.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualOrder {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub size: ManualSize,
}

/// Closing order for one live position during a flatten.
#[derive(Debug)]
pub struct PositionClose {
    pub symbol: String,
    pub side: PositionSide,
    pub result: Result<OrderAck>,
}

pub struct ReplicationExecutor {
    exchanges: Exchanges,
    symbols: Arc<SymbolRegistry>,
    equity: Arc<EquityBook>,
    sizer: PositionSizer,
    epsilon: Decimal,
}

impl ReplicationExecutor {
    pub fn new(
        exchanges: Exchanges,
        symbols: Arc<SymbolRegistry>,
        equity: Arc<EquityBook>,
        epsilon: Decimal,
    ) -> Self {
        Self {
            exchanges,
            symbols,
            equity,
            sizer: PositionSizer::new(epsilon),
            epsilon,
        }
    }

    /// Decide the order for `intent`, or why there is none.
    pub fn plan(
        &self,
        intent: &Intent,
        follower: &Follower,
        inputs: PlanInputs<'_>,
    ) -> Result<OrderPlan, SkipReason> {
        if !follower.position_mode.accepts(intent.position_side) {
            return Err(SkipReason::ModeMismatch {
                mode: follower.position_mode,
                side: intent.position_side,
            });
        }
        if inputs.trader_equity <= Decimal::ZERO {
            return Err(SkipReason::TraderEquityUnavailable);
        }
        if inputs.follower_equity <= Decimal::ZERO {
            return Err(SkipReason::FollowerEquityUnavailable);
        }
        if intent.increases_exposure() && !follower.is_active() {
            return Err(SkipReason::Paused);
        }
        let symbol = inputs.symbol.ok_or(SkipReason::UnknownSymbol)?;
        let merged = intent.position_side == PositionSide::Merged;

        match intent.kind {
            IntentKind::Open | IntentKind::Add => {
                let quantity = self.sizer.open_quantity(
                    intent.trader_qty,
                    inputs.follower_equity,
                    inputs.trader_equity,
                    symbol,
                );
                if self.sizer.is_dust(quantity) {
                    return Err(SkipReason::Dust);
                }
                let delta = if merged {
                    intent.side.sign() * quantity
                } else {
                    quantity
                };
                Ok(self.order_plan(intent, symbol, intent.side, quantity, false, LedgerChange::Apply(delta)))
            }
            IntentKind::Reduce => {
                let magnitude = self.tracked_magnitude(intent, inputs.ledger)?;
                let quantity = self.sizer.reduce_quantity(
                    magnitude,
                    intent.trader_qty,
                    intent.trader_prior,
                    symbol,
                );
                if self.sizer.is_dust(quantity) {
                    return Err(SkipReason::Dust);
                }
                if quantity >= magnitude - self.epsilon {
                    // Never reduce through zero
                    let side = self.closing_side(intent, inputs.ledger);
                    return Ok(self.order_plan(intent, symbol, side, magnitude, true, LedgerChange::Flatten));
                }
                let delta = if merged {
                    intent.side.sign() * quantity
                } else {
                    -quantity
                };
                Ok(self.order_plan(intent, symbol, intent.side, quantity, false, LedgerChange::Apply(delta)))
            }
            IntentKind::Close => {
                let magnitude = if merged {
                    inputs.ledger.abs()
                } else {
                    inputs.ledger
                };
                if magnitude <= self.epsilon {
                    return Err(SkipReason::NothingToClose);
                }
                let side = self.closing_side(intent, inputs.ledger);
                Ok(self.order_plan(intent, symbol, side, magnitude, true, LedgerChange::Flatten))
            }
        }
    }

    /// Ledger magnitude in the intent's direction.
    fn tracked_magnitude(&self, intent: &Intent, ledger: Decimal) -> Result<Decimal, SkipReason> {
        let magnitude = if intent.position_side == PositionSide::Merged {
            // Only reduce a merged entry that points the trader's way
            if PositionSide::from_sign(ledger) != Some(intent.direction()) {
                return Err(SkipReason::NothingToClose);
            }
            ledger.abs()
        } else {
            ledger
        };
        if magnitude <= self.epsilon {
            return Err(SkipReason::NothingToClose);
        }
        Ok(magnitude)
    }

    fn closing_side(&self, intent: &Intent, ledger: Decimal) -> Side {
        if intent.position_side == PositionSide::Merged {
            if ledger > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            }
        } else {
            intent.position_side.closing_side()
        }
    }

    fn order_plan(
        &self,
        intent: &Intent,
        symbol: &SymbolInfo,
        side: Side,
        quantity: Decimal,
        full_close: bool,
        change: LedgerChange,
    ) -> OrderPlan {
        OrderPlan {
            order: OrderRequest {
                symbol: intent.symbol.clone(),
                instrument: symbol.venue_symbol(),
                side,
                quantity,
                position_side: intent.position_side,
                reduce_only: !intent.increases_exposure(),
                close: full_close,
            },
            ledger_side: intent.position_side,
            change,
        }
    }

    /// Plan, submit and record one intent for one follower.
    pub async fn execute(
        &self,
        intent: &Intent,
        follower: &Follower,
        book: &mut FollowerBook,
    ) -> Result<Outcome> {
        let symbol = self.symbols.get(follower.platform, &intent.symbol).await;
        let inputs = PlanInputs {
            symbol: symbol.as_ref(),
            trader_equity: self.equity.trader().await,
            follower_equity: self.equity.follower(follower.id).await * follower.equity_ratio,
            ledger: book.get(&intent.symbol, intent.position_side),
        };

        let plan = match self.plan(intent, follower, inputs) {
            Ok(plan) => plan,
            Err(reason) => {
                match reason {
                    SkipReason::ModeMismatch { .. } | SkipReason::NothingToClose => debug!(
                        follower = follower.id,
                        symbol = %intent.symbol,
                        reason = %reason,
                        "Intent skipped"
                    ),
                    _ => warn!(
                        follower = follower.id,
                        symbol = %intent.symbol,
                        kind = ?intent.kind,
                        reason = %reason,
                        "Intent skipped"
                    ),
                }
                return Ok(Outcome::Skipped(reason));
            }
        };

        let ack = self.submit(follower, &plan.order).await?;

        let ledger = match plan.change {
            LedgerChange::Apply(delta) => book.apply(&intent.symbol, plan.ledger_side, delta),
            LedgerChange::Flatten => {
                book.flatten(&intent.symbol, plan.ledger_side);
                Decimal::ZERO
            }
        };

        info!(
            follower = follower.id,
            symbol = %intent.symbol,
            kind = ?intent.kind,
            side = %plan.order.side,
            position_side = %plan.order.position_side,
            quantity = %plan.order.quantity,
            order_id = ack.order_id,
            filled = %ack.filled_qty,
            ledger = %ledger,
            "Replica order placed"
        );

        Ok(Outcome::Placed {
            order_id: ack.order_id,
            quantity: plan.order.quantity,
            ledger,
        })
    }

    async fn submit(&self, follower: &Follower, order: &OrderRequest) -> Result<OrderAck> {
        let client = self.exchanges.get(follower.platform)?;
        let ack = client
            .place_order(&follower.credentials, order)
            .await
            .with_context(|| format!("Order for follower {} failed", follower.id))?;
        if !ack.is_accepted() {
            bail!(
                "Order for follower {} not accepted (order id {})",
                follower.id,
                ack.order_id
            );
        }
        Ok(ack)
    }

    /// Place an operator-sized order; the ledger moves only when `book` is given.
    pub async fn manual_order(
        &self,
        follower: &Follower,
        order: &ManualOrder,
        book: Option<&mut FollowerBook>,
    ) -> Result<Outcome> {
        if !follower.position_mode.accepts(order.position_side) {
            bail!(
                "{} order does not fit a {} follower",
                order.position_side,
                follower.position_mode
            );
        }
        let symbol = self
            .symbols
            .get(follower.platform, &order.symbol)
            .await
            .with_context(|| format!("Unknown symbol {} on {}", order.symbol, follower.platform))?;

        let (request, change) = match order.size {
            ManualSize::Coins(coins) => {
                let quantity = self.sizer.coins_to_units(coins, &symbol);
                if self.sizer.is_dust(quantity) {
                    bail!("Quantity {} rounds to zero for {}", coins, order.symbol);
                }
                let reducing = if order.position_side.is_dual() {
                    order.side == order.position_side.closing_side()
                } else {
                    // Opposite to the tracked position and no larger than it
                    let held = book
                        .as_deref()
                        .map(|b| b.get(&order.symbol, PositionSide::Merged))
                        .unwrap_or(Decimal::ZERO);
                    order.side.sign() * held < Decimal::ZERO && quantity <= held.abs()
                };
                let delta = if order.position_side.is_dual() {
                    if reducing {
                        -quantity
                    } else {
                        quantity
                    }
                } else {
                    order.side.sign() * quantity
                };
                let request = OrderRequest {
                    symbol: order.symbol.clone(),
                    instrument: symbol.venue_symbol(),
                    side: order.side,
                    quantity,
                    position_side: order.position_side,
                    reduce_only: reducing,
                    close: false,
                };
                (request, LedgerChange::Apply(delta))
            }
            ManualSize::CloseAll => {
                let client = self.exchanges.get(follower.platform)?;
                let live = client.positions(&follower.credentials).await?;
                let position = live
                    .into_iter()
                    .find(|p| p.symbol == order.symbol && p.side == order.position_side)
                    .with_context(|| {
                        format!("No open {} position on {}", order.position_side, order.symbol)
                    })?;
                let request = self
                    .close_request(&position, &symbol)
                    .with_context(|| format!("Position on {} is below the minimum lot", order.symbol))?;
                (request, LedgerChange::Flatten)
            }
        };

        let ack = self.submit(follower, &request).await?;

        let ledger = match book {
            Some(book) => match change {
                LedgerChange::Apply(delta) => book.apply(&order.symbol, order.position_side, delta),
                LedgerChange::Flatten => {
                    book.flatten(&order.symbol, order.position_side);
                    Decimal::ZERO
                }
            },
            None => Decimal::ZERO,
        };

        info!(
            follower = follower.id,
            symbol = %order.symbol,
            side = %request.side,
            position_side = %request.position_side,
            quantity = %request.quantity,
            order_id = ack.order_id,
            filled = %ack.filled_qty,
            "Manual order placed"
        );

        Ok(Outcome::Placed {
            order_id: ack.order_id,
            quantity: request.quantity,
            ledger,
        })
    }

    /// Closing order for a live position, or `None` when it is dust.
    pub fn close_request(&self, position: &ExchangePosition, symbol: &SymbolInfo) -> Option<OrderRequest> {
        let quantity = self.sizer.round_units(position.quantity.abs(), symbol);
        if self.sizer.is_dust(quantity) {
            return None;
        }
        let side = match position.side {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
            PositionSide::Merged if position.quantity > Decimal::ZERO => Side::Sell,
            PositionSide::Merged => Side::Buy,
        };
        Some(OrderRequest {
            symbol: position.symbol.clone(),
            instrument: symbol.venue_symbol(),
            side,
            quantity,
            position_side: position.side,
            reduce_only: true,
            close: true,
        })
    }

    /// Close every live position of a follower, one result per position.
    pub async fn flatten(&self, follower: &Follower) -> Result<Vec<PositionClose>> {
        let client = self.exchanges.get(follower.platform)?;
        let positions = client.positions(&follower.credentials).await?;
        let mut closes = Vec::with_capacity(positions.len());

        for position in positions {
            let Some(symbol) = self.symbols.get(follower.platform, &position.symbol).await else {
                warn!(follower = follower.id, symbol = %position.symbol, "No metadata, leaving position open");
                closes.push(PositionClose {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    result: Err(anyhow!("no metadata for {}", position.symbol)),
                });
                continue;
            };
            let Some(request) = self.close_request(&position, &symbol) else {
                continue;
            };
            let result = self.submit(follower, &request).await;
            if let Err(e) = &result {
                warn!(
                    follower = follower.id,
                    symbol = %position.symbol,
                    error = %e,
                    "Failed to close position"
                );
            }
            closes.push(PositionClose {
                symbol: position.symbol,
                side: position.side,
                result,
            });
        }

        Ok(closes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use crate::models::{Credentials, Enablement, Platform, Transition};
    use rust_decimal_macros::dec;

    const EPS: Decimal = dec!(0.0000001);

    fn follower(id: i64, mode: PositionMode) -> Follower {
        Follower {
            id,
            address: format!("user-{}", id),
            platform: Platform::Binance,
            credentials: Credentials::new(format!("key-{}", id), "secret"),
            equity_ratio: dec!(1),
            enablement: Enablement::Active,
            needs_bootstrap: false,
            position_mode: mode,
        }
    }

    fn symbol(precision: u32) -> SymbolInfo {
        SymbolInfo {
            platform: Platform::Binance,
            symbol: "SYMUSDT".to_string(),
            coin: "SYM".to_string(),
            quantity_precision: precision,
            contract_multiplier: Decimal::ZERO,
        }
    }

    struct Fixture {
        exchange: Arc<MockExchange>,
        executor: ReplicationExecutor,
    }

    async fn fixture(precision: u32) -> Fixture {
        let exchange = Arc::new(MockExchange::new(Platform::Binance));
        let symbols = Arc::new(SymbolRegistry::new());
        symbols.replace(vec![symbol(precision)]).await;
        let equity = Arc::new(EquityBook::new(dec!(100)));
        equity.update_trader(dec!(1000)).await;
        equity.update_follower(1, dec!(100)).await;

        let exchanges = Exchanges::new().with(exchange.clone());
        Fixture {
            exchange,
            executor: ReplicationExecutor::new(exchanges, symbols, equity, EPS),
        }
    }

    fn inputs(symbol: &SymbolInfo, ledger: Decimal) -> PlanInputs<'_> {
        PlanInputs {
            symbol: Some(symbol),
            trader_equity: dec!(1000),
            follower_equity: dec!(100),
            ledger,
        }
    }

    #[tokio::test]
    async fn test_open_long_ten_places_one() {
        let f = fixture(0).await;
        let follower = follower(1, PositionMode::Dual);
        let mut book = FollowerBook::new(1, EPS);

        let intents = Transition::between("SYMUSDT", Decimal::ZERO, dec!(10)).into_intents();
        assert_eq!(intents.len(), 1);

        let outcome = f.executor.execute(&intents[0], &follower, &mut book).await.unwrap();
        assert!(matches!(outcome, Outcome::Placed { quantity, .. } if quantity == dec!(1)));
        assert_eq!(book.get("SYMUSDT", PositionSide::Long), dec!(1));

        let orders = f.exchange.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].position_side, PositionSide::Long);
        assert!(!orders[0].reduce_only);
    }

    #[tokio::test]
    async fn test_partial_reduce_rounding_to_ledger_becomes_full_close() {
        let f = fixture(0).await;
        let follower = follower(1, PositionMode::Dual);
        let mut book = FollowerBook::new(1, EPS);
        book.apply("SYMUSDT", PositionSide::Long, dec!(1));

        // Trader long 10 -> 4: 1 * 6 / 10 = 0.6, rounds to 1
        let intent = Intent::reduce("SYMUSDT", PositionSide::Long, dec!(-6), dec!(10));
        let outcome = f.executor.execute(&intent, &follower, &mut book).await.unwrap();

        assert!(matches!(outcome, Outcome::Placed { quantity, ledger, .. }
            if quantity == dec!(1) && ledger.is_zero()));
        let orders = f.exchange.orders().await;
        assert_eq!(orders[0].side, Side::Sell);
        assert!(orders[0].reduce_only);
        assert!(orders[0].close);
        assert!(book.get("SYMUSDT", PositionSide::Long).is_zero());
    }

    #[tokio::test]
    async fn test_partial_reduce_at_finer_precision() {
        let f = fixture(1).await;
        let symbol = symbol(1);
        let follower = follower(1, PositionMode::Dual);

        let intent = Intent::reduce("SYMUSDT", PositionSide::Long, dec!(-6), dec!(10));
        let plan = f.executor.plan(&intent, &follower, inputs(&symbol, dec!(1))).unwrap();
        assert_eq!(plan.order.quantity, dec!(0.6));
        assert!(!plan.order.close);
        assert_eq!(plan.change, LedgerChange::Apply(dec!(-0.6)));
    }

    #[tokio::test]
    async fn test_full_close_is_exactly_ledger() {
        let f = fixture(3).await;
        let symbol = symbol(3);
        let follower = follower(1, PositionMode::Merged);

        // Ledger drifted away from any equity-derived size
        for ledger in [dec!(0.337), dec!(-1.001), dec!(12.5)] {
            let direction = PositionSide::from_sign(ledger).unwrap();
            let intent = Intent::close("SYMUSDT", direction, dec!(10)).for_mode(PositionMode::Merged);
            let plan = f.executor.plan(&intent, &follower, inputs(&symbol, ledger)).unwrap();
            assert_eq!(plan.order.quantity, ledger.abs());
            assert_eq!(plan.change, LedgerChange::Flatten);
            assert_eq!(
                plan.order.side,
                if ledger > Decimal::ZERO { Side::Sell } else { Side::Buy }
            );
        }
    }

    #[tokio::test]
    async fn test_paused_follower_still_closes() {
        let f = fixture(0).await;
        let symbol = symbol(0);
        let mut follower = follower(1, PositionMode::Dual);
        follower.enablement = Enablement::Paused;

        let open = Intent::open("SYMUSDT", PositionSide::Long, dec!(10));
        let add = Intent::add("SYMUSDT", PositionSide::Long, dec!(5), dec!(10));
        let close = Intent::close("SYMUSDT", PositionSide::Long, dec!(15));

        assert_eq!(
            f.executor.plan(&open, &follower, inputs(&symbol, Decimal::ZERO)),
            Err(SkipReason::Paused)
        );
        assert_eq!(
            f.executor.plan(&add, &follower, inputs(&symbol, dec!(1))),
            Err(SkipReason::Paused)
        );
        assert!(f.executor.plan(&close, &follower, inputs(&symbol, dec!(1))).is_ok());
    }

    #[tokio::test]
    async fn test_preconditions() {
        let f = fixture(0).await;
        let symbol = symbol(0);
        let merged = follower(1, PositionMode::Merged);
        let open = Intent::open("SYMUSDT", PositionSide::Long, dec!(10));

        assert!(matches!(
            f.executor.plan(&open, &merged, inputs(&symbol, Decimal::ZERO)),
            Err(SkipReason::ModeMismatch { .. })
        ));

        let open = open.for_mode(PositionMode::Merged);
        let mut no_trader = inputs(&symbol, Decimal::ZERO);
        no_trader.trader_equity = Decimal::ZERO;
        assert_eq!(
            f.executor.plan(&open, &merged, no_trader),
            Err(SkipReason::TraderEquityUnavailable)
        );

        let mut no_follower = inputs(&symbol, Decimal::ZERO);
        no_follower.follower_equity = dec!(-5);
        assert_eq!(
            f.executor.plan(&open, &merged, no_follower),
            Err(SkipReason::FollowerEquityUnavailable)
        );

        let mut unknown = inputs(&symbol, Decimal::ZERO);
        unknown.symbol = None;
        assert_eq!(f.executor.plan(&open, &merged, unknown), Err(SkipReason::UnknownSymbol));

        let tiny = Intent::open("SYMUSDT", PositionSide::Long, dec!(1)).for_mode(PositionMode::Merged);
        assert_eq!(
            f.executor.plan(&tiny, &merged, inputs(&symbol, Decimal::ZERO)),
            Err(SkipReason::Dust)
        );

        let close = Intent::close("SYMUSDT", PositionSide::Long, dec!(10)).for_mode(PositionMode::Merged);
        assert_eq!(
            f.executor.plan(&close, &merged, inputs(&symbol, Decimal::ZERO)),
            Err(SkipReason::NothingToClose)
        );
    }

    #[tokio::test]
    async fn test_failed_order_leaves_ledger_untouched() {
        let f = fixture(0).await;
        let follower = follower(1, PositionMode::Dual);
        let mut book = FollowerBook::new(1, EPS);
        let open = Intent::open("SYMUSDT", PositionSide::Long, dec!(10));

        f.exchange.fail_orders(true).await;
        assert!(f.executor.execute(&open, &follower, &mut book).await.is_err());
        assert!(book.entries().is_empty());

        f.exchange.fail_orders(false).await;
        f.exchange.reject_orders(true).await;
        assert!(f.executor.execute(&open, &follower, &mut book).await.is_err());
        assert!(book.entries().is_empty());
    }

    #[tokio::test]
    async fn test_merged_open_and_add_sign_the_ledger() {
        let f = fixture(0).await;
        let follower = follower(1, PositionMode::Merged);
        let mut book = FollowerBook::new(1, EPS);

        let open = Intent::open("SYMUSDT", PositionSide::Short, dec!(20)).for_mode(PositionMode::Merged);
        f.executor.execute(&open, &follower, &mut book).await.unwrap();
        assert_eq!(book.get("SYMUSDT", PositionSide::Merged), dec!(-2));

        let add = Intent::add("SYMUSDT", PositionSide::Short, dec!(-10), dec!(-20))
            .for_mode(PositionMode::Merged);
        f.executor.execute(&add, &follower, &mut book).await.unwrap();
        assert_eq!(book.get("SYMUSDT", PositionSide::Merged), dec!(-3));

        let orders = f.exchange.orders().await;
        assert!(orders.iter().all(|o| o.side == Side::Sell && o.position_side == PositionSide::Merged));
    }

    #[tokio::test]
    async fn test_manual_order_tracking_flag() {
        let f = fixture(2).await;
        let follower = follower(1, PositionMode::Dual);
        let mut book = FollowerBook::new(1, EPS);
        let order = ManualOrder {
            symbol: "SYMUSDT".to_string(),
            side: Side::Buy,
            position_side: PositionSide::Long,
            size: ManualSize::Coins(dec!(0.456)),
        };

        f.executor.manual_order(&follower, &order, None).await.unwrap();
        assert!(book.entries().is_empty());

        f.executor.manual_order(&follower, &order, Some(&mut book)).await.unwrap();
        assert_eq!(book.get("SYMUSDT", PositionSide::Long), dec!(0.46));

        let orders = f.exchange.orders().await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].quantity, dec!(0.46));
    }

    #[tokio::test]
    async fn test_merged_manual_reduce_is_reduce_only() {
        let f = fixture(3).await;
        let follower = follower(1, PositionMode::Merged);
        let mut book = FollowerBook::new(1, EPS);
        book.apply("SYMUSDT", PositionSide::Merged, dec!(0.5));

        let order = |side, coins| ManualOrder {
            symbol: "SYMUSDT".to_string(),
            side,
            position_side: PositionSide::Merged,
            size: ManualSize::Coins(coins),
        };

        f.executor
            .manual_order(&follower, &order(Side::Sell, dec!(0.2)), Some(&mut book))
            .await
            .unwrap();
        f.executor
            .manual_order(&follower, &order(Side::Buy, dec!(0.1)), Some(&mut book))
            .await
            .unwrap();
        // Larger than the 0.4 held, so it may flip the position
        f.executor
            .manual_order(&follower, &order(Side::Sell, dec!(1)), Some(&mut book))
            .await
            .unwrap();

        let orders = f.exchange.orders().await;
        assert!(orders[0].reduce_only);
        assert!(!orders[1].reduce_only);
        assert!(!orders[2].reduce_only);
        assert_eq!(book.get("SYMUSDT", PositionSide::Merged), dec!(-0.6));
    }

    #[tokio::test]
    async fn test_manual_close_all_uses_live_position() {
        let f = fixture(3).await;
        let follower = follower(1, PositionMode::Merged);
        f.exchange
            .set_positions(
                "key-1",
                vec![ExchangePosition {
                    symbol: "SYMUSDT".to_string(),
                    side: PositionSide::Merged,
                    quantity: dec!(-0.75),
                }],
            )
            .await;
        let mut book = FollowerBook::new(1, EPS);
        book.apply("SYMUSDT", PositionSide::Merged, dec!(-0.75));

        let order = ManualOrder {
            symbol: "SYMUSDT".to_string(),
            side: Side::Buy,
            position_side: PositionSide::Merged,
            size: ManualSize::CloseAll,
        };
        f.executor.manual_order(&follower, &order, Some(&mut book)).await.unwrap();

        let orders = f.exchange.orders().await;
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].quantity, dec!(0.75));
        assert!(orders[0].reduce_only);
        assert!(book.is_flat());
    }
}
