//! Engine runner: startup sequence and the periodic maintenance loop.
//!
//! Handles:
//! - Seeding the trader snapshot and opening the execution stream
//! - Running the position tracker on that stream
//! - Refreshing symbol metadata, equities and the follower roster
//! - Draining every worker on shutdown

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{BinanceClient, Exchanges, GateClient};
use crate::db::Database;
use crate::models::{Credentials, Platform};
use crate::trading::{ReplicationConfig, ReplicationCore, RosterSync};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Symbol metadata reload interval (seconds)
    pub symbol_refresh_secs: u64,

    /// Trader and follower equity refresh interval (seconds)
    pub equity_refresh_secs: u64,

    /// Roster sync interval (seconds)
    pub follower_sync_secs: u64,

    /// Log orders instead of sending them
    pub dry_run: bool,

    /// Database URL
    pub database_url: String,

    pub replication: ReplicationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol_refresh_secs: 300,
            equity_refresh_secs: 60,
            follower_sync_secs: 30,
            dry_run: false,
            database_url: "sqlite:copier.db?mode=rwc".to_string(),
            replication: ReplicationConfig::default(),
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub followers: usize,
    pub workers: usize,
    pub symbols: usize,
    pub trader_positions: usize,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Stats ===")?;
        writeln!(f, "Followers:        {}", self.followers)?;
        writeln!(f, "Workers:          {}", self.workers)?;
        writeln!(f, "Symbols:          {}", self.symbols)?;
        write!(f, "Trader positions: {}", self.trader_positions)
    }
}

pub struct Engine {
    config: EngineConfig,
    trader: Credentials,
    core: Arc<ReplicationCore>,
    sync: RosterSync,
    tracker: Option<JoinHandle<()>>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Engine against the production venues.
    pub async fn new(config: EngineConfig, trader: Credentials) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_url).await?);
        let mut exchanges = Exchanges::new()
            .with(Arc::new(BinanceClient::new()?))
            .with(Arc::new(GateClient::new()?));
        if config.dry_run {
            info!("Dry run: follower orders will be logged, not sent");
            exchanges = exchanges.into_dry_run();
        }
        Ok(Self::with_exchanges(config, db, trader, exchanges))
    }

    pub fn with_exchanges(
        config: EngineConfig,
        db: Arc<Database>,
        trader: Credentials,
        exchanges: Exchanges,
    ) -> Self {
        let core = Arc::new(ReplicationCore::new(exchanges, config.replication.clone()));
        let sync = RosterSync::new(core.clone(), db, trader.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            trader,
            core,
            sync,
            tracker: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn core(&self) -> Arc<ReplicationCore> {
        self.core.clone()
    }

    /// Load metadata and equities, seed the snapshot, start the tracker and
    /// admit the current roster.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing engine...");

        let symbols = self.sync.refresh_symbols().await?;
        if let Err(e) = self.sync.refresh_equity().await {
            warn!(error = %e, "Equity unavailable at startup, sizing deferred");
        }

        let binance = self.core.exchanges.get(Platform::Binance)?;
        let positions = binance
            .positions(&self.trader)
            .await
            .context("Failed to fetch trader positions")?;
        let tracker = self.core.tracker();
        // Seeded before the stream opens: a fill landing in between is
        // missed rather than counted twice
        let seeded = tracker.seed(&positions).await;

        let events = binance
            .stream_execution_events(&self.trader, self.shutdown_tx.subscribe())
            .await
            .context("Failed to open trader execution stream")?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.tracker = Some(tokio::spawn(async move {
            tracker.run(events, shutdown_rx).await;
        }));

        let report = self.sync.sync_followers().await?;

        info!(
            symbols,
            trader_positions = seeded,
            followers = report.admitted.len(),
            "Engine initialized"
        );
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            sync_interval = self.config.follower_sync_secs,
            "Starting engine run loop"
        );

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            shutdown_tx.send(true).ok();
        });

        let mut symbol_timer = interval(Duration::from_secs(self.config.symbol_refresh_secs));
        let mut equity_timer = interval(Duration::from_secs(self.config.equity_refresh_secs));
        let mut sync_timer = interval(Duration::from_secs(self.config.follower_sync_secs));
        for timer in [&mut symbol_timer, &mut equity_timer, &mut sync_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Startup already did the first round
            timer.tick().await;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = symbol_timer.tick() => {
                    if let Err(e) = self.sync.refresh_symbols().await {
                        warn!(error = %e, "Symbol refresh failed");
                    }
                }
                _ = equity_timer.tick() => {
                    if let Err(e) = self.sync.refresh_equity().await {
                        warn!(error = %e, "Equity refresh failed");
                    }
                }
                _ = sync_timer.tick() => {
                    if let Err(e) = self.sync.sync_followers().await {
                        error!(error = %e, "Roster sync failed");
                    }
                    self.check_tracker();
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        // Graceful shutdown
        self.shutdown().await;

        Ok(())
    }

    fn check_tracker(&self) {
        match &self.tracker {
            Some(handle) if handle.is_finished() => {
                error!("Position tracker is no longer running");
            }
            Some(_) => debug!("Position tracker alive"),
            None => {}
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_tx.send(true).ok();
    }

    /// Stop the tracker, then drain and stop every worker.
    pub async fn shutdown(&mut self) {
        info!("Shutting down engine...");
        self.stop();

        if let Some(handle) = self.tracker.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Tracker task ended abnormally");
            }
        }
        self.sync.shutdown().await;

        info!("Engine shutdown complete");
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            followers: self.core.roster.len().await,
            workers: self.core.workers.len().await,
            symbols: self.core.symbols.len().await,
            trader_positions: self.core.snapshot.read().await.len(),
        }
    }
}
