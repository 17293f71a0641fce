//! Recording in-memory exchange for tests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex};

use crate::models::{Credentials, ExecutionEvent, Platform};

use super::{ExchangeClient, ExchangePosition, OrderAck, OrderRequest};

#[derive(Default)]
struct MockState {
    equity: HashMap<String, Decimal>,
    positions: HashMap<String, Vec<ExchangePosition>>,
    orders: Vec<(String, OrderRequest)>,
    dual_mode: HashMap<String, bool>,
    next_id: i64,
    fail_orders: bool,
    reject_orders: bool,
    panic_on: Option<String>,
    order_delay: Option<Duration>,
    events: Option<mpsc::UnboundedReceiver<ExecutionEvent>>,
}

/// Fake venue keyed by API key.
pub struct MockExchange {
    platform: Platform,
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Mutex::new(MockState::default()),
        }
    }

    pub async fn set_equity(&self, api_key: &str, equity: Decimal) {
        self.state.lock().await.equity.insert(api_key.to_string(), equity);
    }

    pub async fn set_positions(&self, api_key: &str, positions: Vec<ExchangePosition>) {
        self.state
            .lock()
            .await
            .positions
            .insert(api_key.to_string(), positions);
    }

    /// Make every order fail with a transport-style error.
    pub async fn fail_orders(&self, fail: bool) {
        self.state.lock().await.fail_orders = fail;
    }

    /// Make every order come back with a non-positive id.
    pub async fn reject_orders(&self, reject: bool) {
        self.state.lock().await.reject_orders = reject;
    }

    /// Panic inside `place_order` for this symbol.
    pub async fn panic_on(&self, symbol: &str) {
        self.state.lock().await.panic_on = Some(symbol.to_string());
    }

    pub async fn set_order_delay(&self, delay: Duration) {
        self.state.lock().await.order_delay = Some(delay);
    }

    /// Every accepted or rejected order, in submission order.
    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.state
            .lock()
            .await
            .orders
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub async fn orders_for(&self, api_key: &str) -> Vec<OrderRequest> {
        self.state
            .lock()
            .await
            .orders
            .iter()
            .filter(|(k, _)| k == api_key)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub async fn dual_mode(&self, api_key: &str) -> Option<bool> {
        self.state.lock().await.dual_mode.get(api_key).copied()
    }

    /// Sender feeding the next `stream_execution_events` call.
    pub async fn event_sender(&self) -> mpsc::UnboundedSender<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.events = Some(rx);
        tx
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn account_equity(&self, creds: &Credentials) -> Result<Decimal> {
        match self.state.lock().await.equity.get(&creds.api_key) {
            Some(equity) => Ok(*equity),
            None => bail!("Unknown account {}", creds.api_key),
        }
    }

    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .get(&creds.api_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let delay = self.state.lock().await.order_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.panic_on.as_deref() == Some(order.symbol.as_str()) {
            drop(state);
            panic!("mock exchange blew up on {}", order.symbol);
        }
        if state.fail_orders {
            bail!("connection reset");
        }

        state.orders.push((creds.api_key.clone(), order.clone()));
        if state.reject_orders {
            return Ok(OrderAck {
                order_id: 0,
                filled_qty: Decimal::ZERO,
            });
        }

        state.next_id += 1;
        Ok(OrderAck {
            order_id: state.next_id,
            filled_qty: order.quantity,
        })
    }

    async fn set_dual_mode(&self, creds: &Credentials, dual: bool) -> Result<()> {
        self.state
            .lock()
            .await
            .dual_mode
            .insert(creds.api_key.clone(), dual);
        Ok(())
    }

    async fn stream_execution_events(
        &self,
        _creds: &Credentials,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>> {
        match self.state.lock().await.events.take() {
            Some(rx) => Ok(rx),
            None => bail!("No event stream prepared"),
        }
    }
}
