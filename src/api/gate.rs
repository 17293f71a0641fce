//! Gate.io USDT-settled futures REST client.
//!
//! Quantities on this venue are whole contracts, signed by direction.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha512};
use tracing::{debug, info};

use crate::models::{Credentials, Platform, PositionSide, Side};

use super::types::*;
use super::{ExchangeClient, ExchangePosition, OrderAck, OrderRequest};

pub const BASE_URL: &str = "https://api.gateio.ws";
const API_PREFIX: &str = "/api/v4";
const SETTLE: &str = "usdt";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Gate.io futures API.
#[derive(Clone)]
pub struct GateClient {
    http: Client,
    base_url: String,
}

impl GateClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: BASE_URL.to_string(),
        })
    }

    /// APIv4 signature: HMAC-SHA512 over method, path, query, body hash and timestamp.
    pub fn sign(
        secret: &str,
        method: &str,
        path: &str,
        query: &str,
        body: &str,
        timestamp: i64,
    ) -> Result<String> {
        let body_hash = hex::encode(Sha512::digest(body.as_bytes()));
        let payload = format!(
            "{}\n{}\n{}\n{}\n{}",
            method, path, query, body_hash, timestamp
        );

        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("Invalid API secret: {}", e))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// "BTC_USDT" -> "BTCUSDT"
    pub fn canonical_symbol(contract: &str) -> String {
        contract.replace('_', "")
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        creds: &Credentials,
        query: &str,
        body: Option<String>,
    ) -> Result<T> {
        let path = format!("{}/futures/{}{}", API_PREFIX, SETTLE, endpoint);
        let body = body.unwrap_or_default();
        let timestamp = Utc::now().timestamp();
        let signature = Self::sign(
            &creds.api_secret,
            method.as_str(),
            &path,
            query,
            &body,
            timestamp,
        )?;

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        debug!(method = %method, path = %path, "Signed Gate request");

        let mut request = self
            .http
            .request(method, &url)
            .header("KEY", &creds.api_key)
            .header("Timestamp", timestamp.to_string())
            .header("SIGN", signature)
            .header("Accept", "application/json");
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {}", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<GateError>(&text) {
                Ok(err) => bail!("{} failed: {} - {} {}", path, status, err.label, err.message),
                Err(_) => bail!("{} failed: {} - {}", path, status, text),
            }
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }

    /// Build the order body for a request already quantized to contracts.
    pub fn order_body(order: &OrderRequest, text: String) -> Result<GateOrderRequest> {
        let mut body = GateOrderRequest {
            contract: order.instrument.clone(),
            size: 0,
            price: "0".to_string(),
            tif: "ioc".to_string(),
            reduce_only: order.reduce_only,
            close: false,
            auto_size: None,
            text,
        };

        if order.close {
            match order.position_side {
                PositionSide::Merged => body.close = true,
                PositionSide::Long => {
                    body.auto_size = Some("close_long".to_string());
                    body.reduce_only = true;
                }
                PositionSide::Short => {
                    body.auto_size = Some("close_short".to_string());
                    body.reduce_only = true;
                }
            }
            return Ok(body);
        }

        let contracts = order
            .quantity
            .trunc()
            .to_i64()
            .filter(|c| *c > 0)
            .with_context(|| format!("Invalid contract count: {}", order.quantity))?;
        body.size = match order.side {
            Side::Buy => contracts,
            Side::Sell => -contracts,
        };
        Ok(body)
    }
}

#[async_trait]
impl ExchangeClient for GateClient {
    fn platform(&self) -> Platform {
        Platform::Gate
    }

    async fn account_equity(&self, creds: &Credentials) -> Result<Decimal> {
        let account: GateAccount = self
            .signed(Method::GET, "/accounts", creds, "", None)
            .await?;
        Ok(account.total)
    }

    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        let positions: Vec<GatePosition> = self
            .signed(Method::GET, "/positions", creds, "", None)
            .await?;

        Ok(positions
            .into_iter()
            .filter(|p| p.size != 0)
            .map(|p| {
                let side = parse_position_side(&p.mode);
                let size = Decimal::from(p.size);
                ExchangePosition {
                    symbol: Self::canonical_symbol(&p.contract),
                    side,
                    quantity: if side.is_dual() { size.abs() } else { size },
                }
            })
            .collect())
    }

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let text = format!("t-{}", &uuid::Uuid::new_v4().simple().to_string()[..16]);
        let body = Self::order_body(order, text)?;
        let payload = serde_json::to_string(&body).context("Failed to encode order")?;

        let response: GateOrderResponse = self
            .signed(Method::POST, "/orders", creds, "", Some(payload))
            .await?;

        info!(
            contract = %body.contract,
            size = body.size,
            close = body.close,
            auto_size = body.auto_size.as_deref().unwrap_or(""),
            order_id = response.id,
            "Gate order placed"
        );

        let filled = (response.size - response.left).abs();
        Ok(OrderAck {
            order_id: response.id,
            filled_qty: Decimal::from(filled),
        })
    }

    async fn set_dual_mode(&self, creds: &Credentials, dual: bool) -> Result<()> {
        let query = format!("dual_mode={}", dual);
        let _: serde_json::Value = self
            .signed(Method::POST, "/dual_mode", creds, &query, None)
            .await?;
        Ok(())
    }
}
