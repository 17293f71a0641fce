//! Wire types for the Binance futures and Gate.io futures APIs.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{ExecutionEvent, OrderKind, PositionSide};

/// Response from GET /fapi/v2/account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceAccount {
    pub total_margin_balance: Decimal,
    #[serde(default)]
    pub positions: Vec<BinancePosition>,
}

/// Position entry of the account response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinancePosition {
    pub symbol: String,
    pub position_side: String,
    pub position_amt: Decimal,
}

/// Response from POST /fapi/v1/order (or its error body).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrderResponse {
    #[serde(default)]
    pub order_id: i64,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub status: String,
    pub code: Option<i64>,
    pub msg: Option<String>,
}

/// Generic `{code, msg}` body.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceStatus {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    pub listen_key: String,
}

/// Response from GET /fapi/v1/exchangeInfo.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSymbol {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub contract_type: String,
    pub quantity_precision: u32,
    #[serde(default)]
    pub price_precision: u32,
}

/// Entry of GET /sapi/v1/asset/wallet/balance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    #[serde(default)]
    pub activate: bool,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// Envelope used to dispatch user data stream messages on their type.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "e")]
    pub event_type: String,
}

/// `ORDER_TRADE_UPDATE` user data stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: OrderUpdate,
}

/// Order section of an `ORDER_TRADE_UPDATE` event.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "q")]
    pub original_qty: Decimal,
    #[serde(rename = "l")]
    pub last_filled_qty: Decimal,
    #[serde(rename = "z")]
    pub cumulative_filled_qty: Decimal,
    #[serde(rename = "R", default)]
    pub reduce_only: bool,
    #[serde(rename = "cp", default)]
    pub close_position: bool,
    #[serde(rename = "ps")]
    pub position_side: String,
    #[serde(rename = "i")]
    pub order_id: i64,
}

impl OrderTradeUpdate {
    /// Normalize into an [`ExecutionEvent`].
    pub fn into_event(self) -> Result<ExecutionEvent> {
        let o = self.order;
        let event_time = Utc
            .timestamp_millis_opt(self.event_time)
            .single()
            .context("Invalid event time")?;

        Ok(ExecutionEvent {
            side: o.side.parse()?,
            position_side: o.position_side.parse()?,
            order_kind: OrderKind::parse(&o.order_type),
            symbol: o.symbol,
            execution_type: o.execution_type,
            order_status: o.order_status,
            original_qty: o.original_qty,
            last_filled_qty: o.last_filled_qty,
            cumulative_filled_qty: o.cumulative_filled_qty,
            reduce_only: o.reduce_only,
            close_position: o.close_position,
            order_id: o.order_id,
            event_time,
        })
    }
}

/// Response from GET /futures/usdt/accounts.
#[derive(Debug, Clone, Deserialize)]
pub struct GateAccount {
    pub total: Decimal,
}

/// Entry of GET /futures/usdt/positions.
#[derive(Debug, Clone, Deserialize)]
pub struct GatePosition {
    pub contract: String,
    /// Signed contract count
    pub size: i64,
    #[serde(default)]
    pub mode: String,
}

/// Body of POST /futures/usdt/orders.
#[derive(Debug, Clone, Serialize)]
pub struct GateOrderRequest {
    pub contract: String,
    /// Signed contract count; 0 when closing by flag
    pub size: i64,
    pub price: String,
    pub tif: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub close: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_size: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateOrderResponse {
    pub id: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub left: i64,
}

/// Gate error body.
#[derive(Debug, Clone, Deserialize)]
pub struct GateError {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub message: String,
}

/// Map a venue position-side string, defaulting unknown values to merged.
pub fn parse_position_side(raw: &str) -> PositionSide {
    raw.parse().unwrap_or(PositionSide::Merged)
}
