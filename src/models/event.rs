//! Execution reports observed on the trader's account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{PositionSide, Side};

/// Order type of the reported order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    /// Stop, take-profit, liquidation and other venue-specific types
    Other(String),
}

impl OrderKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "MARKET" => OrderKind::Market,
            "LIMIT" => OrderKind::Limit,
            other => OrderKind::Other(other.to_string()),
        }
    }
}

/// Normalized execution report, one per order state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub symbol: String,

    pub side: Side,

    pub position_side: PositionSide,

    pub order_kind: OrderKind,

    /// NEW, TRADE, CANCELED, EXPIRED, ...
    pub execution_type: String,

    /// NEW, PARTIALLY_FILLED, FILLED, ...
    pub order_status: String,

    /// Quantity the order was placed for
    pub original_qty: Decimal,

    /// Quantity filled by this report
    pub last_filled_qty: Decimal,

    /// Quantity filled so far, including this report
    pub cumulative_filled_qty: Decimal,

    /// Order can only shrink the position
    #[serde(default)]
    pub reduce_only: bool,

    /// Order closes the whole position
    #[serde(default)]
    pub close_position: bool,

    pub order_id: i64,

    pub event_time: DateTime<Utc>,
}

impl ExecutionEvent {
    /// A fill report (partial or complete).
    pub fn is_fill(&self) -> bool {
        self.execution_type == "TRADE"
            && matches!(self.order_status.as_str(), "PARTIALLY_FILLED" | "FILLED")
    }

    /// The first fill of its order; later partial fills repeat the same order.
    pub fn is_first_fill(&self) -> bool {
        self.is_fill() && self.last_filled_qty == self.cumulative_filled_qty
    }

    /// The order's quantity, negative for sells.
    pub fn signed_qty(&self) -> Decimal {
        self.side.sign() * self.original_qty
    }
}
