//! Binance user data stream for the trader's execution reports.
//!
//! The stream is kept alive transparently to its consumer: the listen key
//! is renewed on a cadence inside its 60 minute expiry, the connection is
//! cycled before the venue's 24 hour limit, and any drop is followed by a
//! reconnect after a fixed delay, forever, until shutdown.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use backoff::ExponentialBackoffBuilder;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::{Credentials, ExecutionEvent};

use super::types::{OrderTradeUpdate, StreamEnvelope};
use super::BinanceClient;

/// Timing of the user data stream upkeep.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Listen-key renewal cadence
    pub renew_interval: Duration,

    /// Connection lifetime before a planned reconnect
    pub cycle_interval: Duration,

    /// Delay before reconnecting after a failure
    pub reconnect_delay: Duration,

    /// Pause after a read error before reconnecting
    pub read_error_pause: Duration,

    /// Give up creating a listen key for this session after this long
    pub listen_key_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(29 * 60),
            cycle_interval: Duration::from_secs(23 * 60 * 60),
            reconnect_delay: Duration::from_secs(5),
            read_error_pause: Duration::from_millis(100),
            listen_key_timeout: Duration::from_secs(60),
        }
    }
}

/// Message of interest on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Execution(ExecutionEvent),
    ListenKeyExpired,
}

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Cycle,
    ListenKeyExpired,
}

/// Self-healing execution report stream.
pub struct UserDataStream {
    client: BinanceClient,
    creds: Credentials,
    config: StreamConfig,
}

impl UserDataStream {
    pub fn new(client: BinanceClient, creds: Credentials, config: StreamConfig) -> Self {
        Self {
            client,
            creds,
            config,
        }
    }

    /// Run the stream in the background and hand back its event receiver.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.run(tx, shutdown).await;
        });
        rx
    }

    async fn run(self, tx: mpsc::UnboundedSender<ExecutionEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() || tx.is_closed() {
                break;
            }

            match self.session(&tx, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Cycle) => {
                    info!("Cycling user data stream connection");
                    continue;
                }
                Ok(SessionEnd::ListenKeyExpired) => {
                    warn!("Listen key expired, reconnecting with a new one");
                    continue;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "User data stream failed, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("User data stream stopped");
    }

    async fn obtain_listen_key(&self) -> Result<String> {
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(self.config.listen_key_timeout))
            .build();

        backoff::future::retry(policy, || async {
            self.client
                .create_listen_key(&self.creds.api_key)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Listen key request failed, retrying");
                    backoff::Error::transient(e)
                })
        })
        .await
    }

    async fn session(
        &self,
        tx: &mpsc::UnboundedSender<ExecutionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let listen_key = self.obtain_listen_key().await?;
        let url = format!("{}/{}", self.client.ws_url(), listen_key);

        let (ws, _) = connect_async(url.as_str())
            .await
            .context("Failed to connect user data stream")?;
        info!("User data stream connected");

        let (mut write, mut read) = ws.split();

        let mut renew = interval_at(
            Instant::now() + self.config.renew_interval,
            self.config.renew_interval,
        );
        let cycle = sleep(self.config.cycle_interval);
        tokio::pin!(cycle);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = renew.tick() => {
                    match self.client.renew_listen_key(&self.creds.api_key).await {
                        Ok(()) => debug!("Listen key renewed"),
                        Err(e) => warn!(error = %e, "Listen key renewal failed"),
                    }
                }
                _ = &mut cycle => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cycle);
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_message(&text) {
                        Ok(Some(StreamMessage::Execution(event))) => {
                            if tx.send(event).is_err() {
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Ok(Some(StreamMessage::ListenKeyExpired)) => {
                            return Ok(SessionEnd::ListenKeyExpired);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropping malformed stream message"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        bail!("Stream closed by server: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sleep(self.config.read_error_pause).await;
                        return Err(e).context("Stream read failed");
                    }
                    None => bail!("Stream ended"),
                }
            }
        }
    }
}

/// Decode one stream message; unrelated event types yield `None`.
pub fn parse_message(text: &str) -> Result<Option<StreamMessage>> {
    let envelope: StreamEnvelope =
        serde_json::from_str(text).context("Message has no event type")?;

    match envelope.event_type.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let update: OrderTradeUpdate =
                serde_json::from_str(text).context("Malformed ORDER_TRADE_UPDATE")?;
            Ok(Some(StreamMessage::Execution(update.into_event()?)))
        }
        "listenKeyExpired" => Ok(Some(StreamMessage::ListenKeyExpired)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn fill(order_id: i64) -> String {
        format!(
            r#"{{"e":"ORDER_TRADE_UPDATE","E":1568879465651,"T":1568879465650,"o":{{"s":"BTCUSDT","c":"TEST","S":"SELL","o":"MARKET","f":"GTC","q":"0.001","p":"0","ap":"0","sp":"0","x":"TRADE","X":"FILLED","i":{},"l":"0.001","z":"0.001","L":"9000","N":"USDT","n":"0","T":1568879465650,"t":1,"b":"0","a":"9.91","m":false,"R":false,"wt":"CONTRACT_PRICE","ot":"MARKET","ps":"BOTH","cp":false,"rp":"0"}}}}"#,
            order_id
        )
    }

    #[derive(Default)]
    struct KeyCalls {
        created: AtomicUsize,
        renewed: AtomicUsize,
    }

    /// Plain HTTP/1.1 responder for listen-key POST and PUT requests.
    async fn listen_key_endpoint(calls: Arc<KeyCalls>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let calls = calls.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let body = if request.starts_with(b"POST") {
                        let n = calls.created.fetch_add(1, Ordering::SeqCst) + 1;
                        format!(r#"{{"listenKey":"key-{}"}}"#, n)
                    } else {
                        calls.renewed.fetch_add(1, Ordering::SeqCst);
                        "{}".to_string()
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    enum Session {
        /// Send the messages, then drop the socket without a close frame
        Drop(Vec<String>),
        /// Send the messages and stay open
        Hold(Vec<String>),
    }

    /// Websocket server playing one scripted session per connection.
    async fn stream_endpoint(script: Vec<Session>, connections: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut script = script.into_iter();
            while let Ok((socket, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let session = script.next();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(socket).await else {
                        return;
                    };
                    let (messages, hold) = match session {
                        Some(Session::Drop(messages)) => (messages, false),
                        Some(Session::Hold(messages)) => (messages, true),
                        None => (Vec::new(), true),
                    };
                    for message in messages {
                        if ws.send(Message::text(message)).await.is_err() {
                            return;
                        }
                    }
                    if hold {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            renew_interval: Duration::from_secs(60),
            cycle_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_millis(20),
            read_error_pause: Duration::from_millis(5),
            listen_key_timeout: Duration::from_secs(5),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> ExecutionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_and_key_expiry() {
        let calls = Arc::new(KeyCalls::default());
        let connections = Arc::new(AtomicUsize::new(0));
        let rest = listen_key_endpoint(calls.clone()).await;
        let expired = r#"{"e":"listenKeyExpired","E":1,"listenKey":"key-2"}"#.to_string();
        let ws = stream_endpoint(
            vec![
                Session::Drop(vec![fill(1)]),
                Session::Hold(vec![expired]),
                Session::Hold(vec![fill(3)]),
            ],
            connections.clone(),
        )
        .await;

        let client = BinanceClient::with_urls(rest.clone(), rest, ws).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut events = UserDataStream::new(client, Credentials::new("trader", "secret"), fast_config())
            .spawn(shutdown_rx);

        assert_eq!(next_event(&mut events).await.order_id, 1);
        assert_eq!(next_event(&mut events).await.order_id, 3);
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        // Every connection asked for a fresh listen key
        assert_eq!(calls.created.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        let closed = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_renews_key_and_cycles_connection() {
        let calls = Arc::new(KeyCalls::default());
        let connections = Arc::new(AtomicUsize::new(0));
        let rest = listen_key_endpoint(calls.clone()).await;
        let ws = stream_endpoint(
            vec![Session::Hold(vec![fill(1)]), Session::Hold(vec![fill(2)])],
            connections.clone(),
        )
        .await;

        let config = StreamConfig {
            renew_interval: Duration::from_millis(30),
            cycle_interval: Duration::from_millis(200),
            ..fast_config()
        };
        let client = BinanceClient::with_urls(rest.clone(), rest, ws).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut events =
            UserDataStream::new(client, Credentials::new("trader", "secret"), config).spawn(shutdown_rx);

        assert_eq!(next_event(&mut events).await.order_id, 1);
        assert_eq!(next_event(&mut events).await.order_id, 2);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert!(calls.renewed.load(Ordering::SeqCst) >= 1);

        shutdown_tx.send(true).unwrap();
    }

    #[test]
    fn test_renewal_inside_expiry() {
        let config = StreamConfig::default();
        assert!(config.renew_interval < Duration::from_secs(60 * 60));
        assert!(config.cycle_interval < Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn test_parse_dispatches_on_event_type() {
        let expired = r#"{"e":"listenKeyExpired","E":1576653824250,"listenKey":"abc"}"#;
        assert_eq!(
            parse_message(expired).unwrap(),
            Some(StreamMessage::ListenKeyExpired)
        );

        let account = r#"{"e":"ACCOUNT_UPDATE","E":1,"T":1,"a":{"m":"ORDER","B":[],"P":[]}}"#;
        assert_eq!(parse_message(account).unwrap(), None);

        assert!(parse_message("not json").is_err());

        let broken = r#"{"e":"ORDER_TRADE_UPDATE","E":1,"o":{"s":"BTCUSDT"}}"#;
        assert!(parse_message(broken).is_err());
    }
}
