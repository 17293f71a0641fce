//! Normalized trading intents derived from trader position changes.
//!
//! An [`Intent`] describes one observed change of the trader's book as a
//! direction plus magnitudes. [`Transition::between`] classifies a change
//! from a prior to a new merged amount into the intents that reproduce it;
//! a move through zero always becomes a close followed by an open.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{PositionMode, PositionSide, Side};

/// Transition class of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    /// Flat to non-flat
    Open,
    /// Same direction, larger magnitude
    Add,
    /// Same direction, smaller but non-zero magnitude
    Reduce,
    /// Non-flat to flat
    Close,
}

/// Immutable message fanned out to every follower queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub symbol: String,

    pub position_side: PositionSide,

    pub side: Side,

    pub kind: IntentKind,

    /// Unsigned trader quantity this change represents
    pub trader_qty: Decimal,

    /// Trader magnitude on this side before the change
    pub trader_prior: Decimal,
}

impl Intent {
    /// Flat to `magnitude` in `direction`.
    pub fn open(symbol: impl Into<String>, direction: PositionSide, magnitude: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            position_side: direction,
            side: direction.opening_side(),
            kind: IntentKind::Open,
            trader_qty: magnitude.abs(),
            trader_prior: Decimal::ZERO,
        }
    }

    pub fn add(
        symbol: impl Into<String>,
        direction: PositionSide,
        delta: Decimal,
        prior: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            position_side: direction,
            side: direction.opening_side(),
            kind: IntentKind::Add,
            trader_qty: delta.abs(),
            trader_prior: prior.abs(),
        }
    }

    pub fn reduce(
        symbol: impl Into<String>,
        direction: PositionSide,
        delta: Decimal,
        prior: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            position_side: direction,
            side: direction.closing_side(),
            kind: IntentKind::Reduce,
            trader_qty: delta.abs(),
            trader_prior: prior.abs(),
        }
    }

    /// `prior` in `direction` to flat.
    pub fn close(symbol: impl Into<String>, direction: PositionSide, prior: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            position_side: direction,
            side: direction.closing_side(),
            kind: IntentKind::Close,
            trader_qty: prior.abs(),
            trader_prior: prior.abs(),
        }
    }

    /// Opens and adds create exposure; reduces and closes only remove it.
    pub fn increases_exposure(&self) -> bool {
        matches!(self.kind, IntentKind::Open | IntentKind::Add)
    }

    /// The trader book this intent acts on, regardless of representation.
    pub fn direction(&self) -> PositionSide {
        match (self.increases_exposure(), self.side) {
            (true, Side::Buy) | (false, Side::Sell) => PositionSide::Long,
            (true, Side::Sell) | (false, Side::Buy) => PositionSide::Short,
        }
    }

    /// Re-express this intent for a follower running in `mode`.
    pub fn for_mode(&self, mode: PositionMode) -> Self {
        let position_side = match mode {
            PositionMode::Merged => PositionSide::Merged,
            PositionMode::Dual => self.direction(),
        };
        Self {
            position_side,
            ..self.clone()
        }
    }
}

/// Classified change of one merged trader position.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    Opened(Intent),
    Added(Intent),
    Reduced(Intent),
    Closed(Intent),
    /// Crossed zero: flatten the old direction before opening the new one
    Flipped { close: Intent, open: Intent },
}

impl Transition {
    /// Classify the move of a merged position from `prior` to `next`.
    pub fn between(symbol: &str, prior: Decimal, next: Decimal) -> Self {
        match (PositionSide::from_sign(prior), PositionSide::from_sign(next)) {
            (None, None) => Transition::Unchanged,
            (Some(from), None) => Transition::Closed(Intent::close(symbol, from, prior)),
            (None, Some(to)) => Transition::Opened(Intent::open(symbol, to, next)),
            (Some(from), Some(to)) if from == to => {
                let delta = next - prior;
                if delta.is_zero() {
                    Transition::Unchanged
                } else if next.abs() > prior.abs() {
                    Transition::Added(Intent::add(symbol, from, delta, prior))
                } else {
                    Transition::Reduced(Intent::reduce(symbol, from, delta, prior))
                }
            }
            (Some(from), Some(to)) => Transition::Flipped {
                close: Intent::close(symbol, from, prior),
                open: Intent::open(symbol, to, next),
            },
        }
    }

    /// Intents in delivery order.
    pub fn into_intents(self) -> Vec<Intent> {
        match self {
            Transition::Unchanged => Vec::new(),
            Transition::Opened(i)
            | Transition::Added(i)
            | Transition::Reduced(i)
            | Transition::Closed(i) => vec![i],
            Transition::Flipped { close, open } => vec![close, open],
        }
    }
}
