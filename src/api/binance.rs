//! Binance USDⓈ-M futures REST client.
//!
//! Signed endpoints take the query string plus `timestamp`/`recvWindow`,
//! signed with HMAC-SHA256 over the exact query and sent with the
//! `X-MBX-APIKEY` header.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::models::{Credentials, ExecutionEvent, Platform, PositionSide};

use super::stream::{StreamConfig, UserDataStream};
use super::types::*;
use super::{ExchangeClient, ExchangePosition, OrderAck, OrderRequest};

pub const FAPI_URL: &str = "https://fapi.binance.com";
pub const SPOT_URL: &str = "https://api.binance.com";
pub const WS_URL: &str = "wss://fstream.binance.com/ws";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW: u64 = 5000;

/// Client for the Binance futures API.
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    fapi_url: String,
    spot_url: String,
    ws_url: String,
    stream_config: StreamConfig,
}

impl BinanceClient {
    /// Create a new client against the production endpoints.
    pub fn new() -> Result<Self> {
        Self::with_urls(FAPI_URL, SPOT_URL, WS_URL)
    }

    /// Client against custom futures, spot and stream endpoints.
    pub fn with_urls(
        fapi_url: impl Into<String>,
        spot_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            fapi_url: fapi_url.into(),
            spot_url: spot_url.into(),
            ws_url: ws_url.into(),
            stream_config: StreamConfig::default(),
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HMAC-SHA256 signature of `query`, hex encoded.
    pub fn sign(secret: &str, query: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("Invalid API secret: {}", e))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Quantity in the plain decimal notation the venue accepts.
    pub fn format_quantity(quantity: Decimal) -> String {
        quantity.normalize().to_string()
    }

    fn signed_query(creds: &Credentials, params: &[(&str, String)]) -> Result<String> {
        let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        pairs.push(format!("recvWindow={}", RECV_WINDOW));

        let query = pairs.join("&");
        let signature = Self::sign(&creds.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        base: &str,
        path: &str,
        creds: &Credentials,
        params: &[(&str, String)],
    ) -> Result<T> {
        let query = Self::signed_query(creds, params)?;
        let url = format!("{}{}?{}", base, path, query);

        debug!(method = %method, path = %path, "Signed Binance request");

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to call {}", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{} failed: {} - {}", path, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }

    /// Full futures account including every position entry.
    pub async fn account(&self, creds: &Credentials) -> Result<BinanceAccount> {
        self.signed(Method::GET, &self.fapi_url, "/fapi/v2/account", creds, &[])
            .await
    }

    /// Total value of every wallet of the account, in USDT.
    pub async fn total_wallet_value(&self, creds: &Credentials) -> Result<Decimal> {
        let wallets: Vec<WalletBalance> = self
            .signed(
                Method::GET,
                &self.spot_url,
                "/sapi/v1/asset/wallet/balance",
                creds,
                &[("quoteAsset", "BTC".to_string())],
            )
            .await?;

        let btc: Decimal = wallets.iter().filter(|w| w.activate).map(|w| w.balance).sum();
        let price = self.ticker_price("BTCUSDT").await?;
        Ok(btc * price)
    }

    /// Latest spot price of `symbol`.
    pub async fn ticker_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.spot_url, symbol);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch ticker price")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ticker request failed: {} - {}", status, body);
        }

        let ticker: TickerPrice = response
            .json()
            .await
            .context("Failed to parse ticker response")?;
        Ok(ticker.price)
    }

    /// Tradable perpetual USDT contracts.
    pub async fn exchange_info(&self) -> Result<Vec<ExchangeSymbol>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.fapi_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch exchange info")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Exchange info request failed: {} - {}", status, body);
        }

        let info: ExchangeInfo = response
            .json()
            .await
            .context("Failed to parse exchange info")?;

        Ok(info
            .symbols
            .into_iter()
            .filter(|s| s.quote_asset == "USDT" && s.contract_type == "PERPETUAL")
            .collect())
    }

    /// Start a user data stream and return its listen key.
    pub async fn create_listen_key(&self, api_key: &str) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.fapi_url);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .context("Failed to create listen key")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Listen key creation failed: {} - {}", status, body);
        }

        let key: ListenKeyResponse = response
            .json()
            .await
            .context("Failed to parse listen key response")?;
        Ok(key.listen_key)
    }

    /// Extend the validity of the account's active listen key.
    pub async fn renew_listen_key(&self, api_key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.fapi_url);
        let response = self
            .http
            .put(&url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .context("Failed to renew listen key")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Listen key renewal failed: {} - {}", status, body);
        }

        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn platform(&self) -> Platform {
        Platform::Binance
    }

    async fn account_equity(&self, creds: &Credentials) -> Result<Decimal> {
        Ok(self.account(creds).await?.total_margin_balance)
    }

    async fn wallet_equity(&self, creds: &Credentials) -> Result<Decimal> {
        self.total_wallet_value(creds).await
    }

    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        let account = self.account(creds).await?;
        Ok(account
            .positions
            .into_iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|p| {
                let side = parse_position_side(&p.position_side);
                let quantity = if side.is_dual() {
                    p.position_amt.abs()
                } else {
                    p.position_amt
                };
                ExchangePosition {
                    symbol: p.symbol,
                    side,
                    quantity,
                }
            })
            .collect())
    }

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", order.instrument.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("positionSide", order.position_side.as_str().to_string()),
            ("quantity", Self::format_quantity(order.quantity)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        // Hedge-mode orders reject the flag; the position side already implies it
        if order.reduce_only && order.position_side == PositionSide::Merged {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: BinanceOrderResponse = self
            .signed(Method::POST, &self.fapi_url, "/fapi/v1/order", creds, &params)
            .await?;

        if let Some(code) = response.code {
            bail!(
                "Order rejected: {} - {}",
                code,
                response.msg.unwrap_or_default()
            );
        }

        info!(
            symbol = %order.instrument,
            side = %order.side,
            position_side = %order.position_side,
            quantity = %order.quantity,
            order_id = response.order_id,
            status = %response.status,
            "Binance order placed"
        );

        Ok(OrderAck {
            order_id: response.order_id,
            filled_qty: response.executed_qty,
        })
    }

    async fn set_dual_mode(&self, creds: &Credentials, dual: bool) -> Result<()> {
        let status: BinanceStatus = self
            .signed(
                Method::POST,
                &self.fapi_url,
                "/fapi/v1/positionSide/dual",
                creds,
                &[("dualSidePosition", dual.to_string())],
            )
            .await?;

        if status.code != 200 {
            bail!("Position mode change rejected: {} - {}", status.code, status.msg);
        }
        Ok(())
    }

    async fn stream_execution_events(
        &self,
        creds: &Credentials,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>> {
        let stream = UserDataStream::new(self.clone(), creds.clone(), self.stream_config.clone());
        Ok(stream.spawn(shutdown))
    }
}
