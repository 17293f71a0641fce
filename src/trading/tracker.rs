//! Position tracker: the trader's merged positions and the intents their
//! changes produce.
//!
//! The tracker is the only writer of the snapshot. It updates the snapshot
//! and broadcasts the resulting intents while holding the write guard, so a
//! reader holding the read guard sees a state that matches exactly what the
//! bus has delivered so far.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::api::ExchangePosition;
use crate::models::{ExecutionEvent, Intent, PositionSide, TraderPosition, Transition};

use super::bus::FanoutBus;

/// Trader's signed merged amount per symbol.
#[derive(Debug, Default, Clone)]
pub struct PositionSnapshot {
    positions: HashMap<String, Decimal>,
}

impl PositionSnapshot {
    pub fn get(&self, symbol: &str) -> Decimal {
        self.positions.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    fn set(&mut self, symbol: &str, amount: Decimal) {
        if amount.is_zero() {
            self.positions.remove(symbol);
        } else {
            self.positions.insert(symbol.to_string(), amount);
        }
    }

    /// Every non-flat position, sorted by symbol.
    pub fn positions(&self) -> Vec<TraderPosition> {
        let mut positions: Vec<TraderPosition> = self
            .positions
            .iter()
            .map(|(symbol, amount)| TraderPosition::new(symbol.clone(), PositionSide::Merged, *amount))
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

pub type SharedSnapshot = Arc<RwLock<PositionSnapshot>>;

pub struct PositionTracker {
    snapshot: SharedSnapshot,
    bus: Arc<FanoutBus>,
    epsilon: Decimal,
}

impl PositionTracker {
    pub fn new(snapshot: SharedSnapshot, bus: Arc<FanoutBus>, epsilon: Decimal) -> Self {
        Self {
            snapshot,
            bus,
            epsilon,
        }
    }

    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Replace the snapshot with the trader's reported positions.
    ///
    /// Only merged entries are kept; nothing is broadcast.
    pub async fn seed(&self, positions: &[ExchangePosition]) -> usize {
        let mut snapshot = self.snapshot.write().await;
        snapshot.positions.clear();

        for position in positions {
            if position.side != PositionSide::Merged {
                warn!(symbol = %position.symbol, side = %position.side, "Ignoring dual-mode trader position");
                continue;
            }
            snapshot.set(&position.symbol, position.quantity);
        }

        info!(positions = snapshot.len(), "Trader snapshot seeded");
        snapshot.len()
    }

    /// Amount after applying `event` to `prior`, or `None` when the event
    /// does not change the position.
    pub fn next_amount(&self, prior: Decimal, event: &ExecutionEvent) -> Option<Decimal> {
        if event.position_side != PositionSide::Merged {
            debug!(symbol = %event.symbol, side = %event.position_side, "Dual-mode event not tracked");
            return None;
        }
        if !event.is_first_fill() {
            debug!(
                symbol = %event.symbol,
                execution_type = %event.execution_type,
                status = %event.order_status,
                order_id = event.order_id,
                order_kind = ?event.order_kind,
                "Event discarded"
            );
            return None;
        }

        let mut next = if event.close_position {
            Decimal::ZERO
        } else {
            prior + event.signed_qty()
        };

        if event.reduce_only {
            let crossed = (prior > Decimal::ZERO && next < Decimal::ZERO)
                || (prior < Decimal::ZERO && next > Decimal::ZERO);
            if prior.is_zero() || crossed {
                next = Decimal::ZERO;
            }
        }
        if next.abs() <= self.epsilon {
            next = Decimal::ZERO;
        }

        Some(next)
    }

    /// Apply one event: update the snapshot and broadcast its intents.
    pub async fn apply(&self, event: &ExecutionEvent) -> Vec<Intent> {
        let mut snapshot = self.snapshot.write().await;
        let prior = snapshot.get(&event.symbol);

        let Some(next) = self.next_amount(prior, event) else {
            return Vec::new();
        };

        let intents = Transition::between(&event.symbol, prior, next).into_intents();
        snapshot.set(&event.symbol, next);

        for intent in &intents {
            let delivered = self.bus.broadcast(intent).await;
            info!(
                symbol = %intent.symbol,
                kind = ?intent.kind,
                side = %intent.side,
                position_side = %intent.position_side,
                trader_qty = %intent.trader_qty,
                trader_prior = %intent.trader_prior,
                delivered,
                "Intent broadcast"
            );
        }
        if intents.is_empty() {
            debug!(symbol = %event.symbol, amount = %next, "No position change");
        }

        intents
    }

    /// Consume the event stream until it ends or shutdown is signalled.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Position tracker started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply(&event).await;
                    }
                    None => {
                        warn!("Execution stream closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Position tracker stopped");
    }
}
