//! Exchange clients: REST order/account access and the trader's user data stream.

mod binance;
mod dry_run;
mod gate;
mod stream;
mod types;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::models::{Credentials, ExecutionEvent, Platform, PositionSide, Side};

pub use binance::BinanceClient;
pub use dry_run::DryRunClient;
pub use gate::GateClient;
pub use types::*;

/// Position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Canonical symbol (e.g. "BTCUSDT")
    pub symbol: String,

    pub side: PositionSide,

    /// Venue units; signed for `Merged`
    pub quantity: Decimal,
}

/// Market order handed to an exchange client.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Canonical symbol
    pub symbol: String,

    /// Instrument name in the venue's notation
    pub instrument: String,

    pub side: Side,

    /// Venue units, always positive; ignored by venues that close by flag
    pub quantity: Decimal,

    pub position_side: PositionSide,

    /// Order may only shrink the position
    pub reduce_only: bool,

    /// Order closes the entire position on this side
    pub close: bool,
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    /// Venue order id; not positive means the order was not accepted
    pub order_id: i64,

    pub filled_qty: Decimal,
}

impl OrderAck {
    pub fn is_accepted(&self) -> bool {
        self.order_id > 0
    }
}

/// Operations the replication core needs from a derivatives venue.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// Account equity in USDT.
    async fn account_equity(&self, creds: &Credentials) -> Result<Decimal>;

    /// Value of every wallet of the account in USDT; the futures equity
    /// where the venue has no wider notion.
    async fn wallet_equity(&self, creds: &Credentials) -> Result<Decimal> {
        self.account_equity(creds).await
    }

    /// Non-zero open positions.
    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>>;

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck>;

    /// Switch the account between merged and dual position mode.
    async fn set_dual_mode(&self, creds: &Credentials, dual: bool) -> Result<()>;

    /// Long-lived execution report stream; renews and reconnects on its own
    /// until `shutdown` flips to true.
    async fn stream_execution_events(
        &self,
        _creds: &Credentials,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>> {
        bail!("{} does not provide an execution stream", self.platform())
    }
}

/// Exchange clients by platform.
#[derive(Clone, Default)]
pub struct Exchanges {
    clients: HashMap<Platform, Arc<dyn ExchangeClient>>,
}

impl Exchanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn ExchangeClient>) -> Self {
        self.clients.insert(client.platform(), client);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn ExchangeClient>> {
        match self.clients.get(&platform) {
            Some(client) => Ok(client.clone()),
            None => bail!("No client configured for {}", platform),
        }
    }

    /// Wrap every client so orders are logged instead of sent.
    pub fn into_dry_run(self) -> Self {
        let clients = self
            .clients
            .into_iter()
            .map(|(platform, inner)| {
                let wrapped: Arc<dyn ExchangeClient> = Arc::new(DryRunClient::new(inner));
                (platform, wrapped)
            })
            .collect();
        Self { clients }
    }
}
