//! Exchange client that logs orders instead of sending them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::models::{Credentials, ExecutionEvent, Platform};

use super::{ExchangeClient, ExchangePosition, OrderAck, OrderRequest};

/// Wraps a real client; account reads and the stream go through, orders do not.
pub struct DryRunClient {
    inner: Arc<dyn ExchangeClient>,
    next_order_id: AtomicI64,
}

impl DryRunClient {
    pub fn new(inner: Arc<dyn ExchangeClient>) -> Self {
        Self {
            inner,
            next_order_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl ExchangeClient for DryRunClient {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    async fn account_equity(&self, creds: &Credentials) -> Result<Decimal> {
        self.inner.account_equity(creds).await
    }

    async fn wallet_equity(&self, creds: &Credentials) -> Result<Decimal> {
        self.inner.wallet_equity(creds).await
    }

    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        self.inner.positions(creds).await
    }

    async fn place_order(&self, _creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        info!(
            platform = %self.platform(),
            symbol = %order.instrument,
            side = %order.side,
            position_side = %order.position_side,
            quantity = %order.quantity,
            reduce_only = order.reduce_only,
            close = order.close,
            order_id,
            "[DRY RUN] Would place order"
        );
        Ok(OrderAck {
            order_id,
            filled_qty: order.quantity,
        })
    }

    async fn set_dual_mode(&self, _creds: &Credentials, dual: bool) -> Result<()> {
        info!(platform = %self.platform(), dual, "[DRY RUN] Would switch position mode");
        Ok(())
    }

    async fn stream_execution_events(
        &self,
        creds: &Credentials,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>> {
        self.inner.stream_execution_events(creds, shutdown).await
    }
}
