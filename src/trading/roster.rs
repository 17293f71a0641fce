//! Follower roster and its reconciliation against the store.
//!
//! [`RosterSync`] is the only writer of roster membership and queue
//! binding. Admission binds the queue and reads the trader snapshot under
//! the snapshot read guard, so each intent either shows up in the bootstrap
//! or in the queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::db::{FollowerStore, FollowerUpdate};
use crate::models::{Credentials, Follower, Intent, Platform, PositionSide, TraderPosition};

use super::config::TraderEquitySource;
use super::executor::Outcome;
use super::ledger::SharedBook;
use super::worker::Worker;
use super::ReplicationCore;

/// In-memory mirror of the enabled followers.
#[derive(Default)]
pub struct Roster {
    followers: RwLock<HashMap<i64, Follower>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, follower_id: i64) -> Option<Follower> {
        self.followers.read().await.get(&follower_id).cloned()
    }

    /// Insert or replace; returns the previous entry.
    pub async fn insert(&self, follower: Follower) -> Option<Follower> {
        self.followers.write().await.insert(follower.id, follower)
    }

    pub async fn remove(&self, follower_id: i64) -> Option<Follower> {
        self.followers.write().await.remove(&follower_id)
    }

    pub async fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.followers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every follower, by id.
    pub async fn all(&self) -> Vec<Follower> {
        let mut followers: Vec<Follower> = self.followers.read().await.values().cloned().collect();
        followers.sort_by_key(|f| f.id);
        followers
    }

    pub async fn len(&self) -> usize {
        self.followers.read().await.len()
    }
}

/// What one sync pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub admitted: Vec<i64>,
    pub departed: Vec<i64>,
    pub updated: Vec<i64>,
    pub restarted: Vec<i64>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
            && self.departed.is_empty()
            && self.updated.is_empty()
            && self.restarted.is_empty()
    }
}

/// Periodic reconciliation of roster, equities and symbols.
pub struct RosterSync {
    core: Arc<ReplicationCore>,
    store: Arc<dyn FollowerStore>,
    trader: Credentials,
}

impl RosterSync {
    pub fn new(core: Arc<ReplicationCore>, store: Arc<dyn FollowerStore>, trader: Credentials) -> Self {
        Self {
            core,
            store,
            trader,
        }
    }

    /// Reload symbol metadata from the store.
    pub async fn refresh_symbols(&self) -> Result<usize> {
        let listing = self.store.list_symbols().await?;
        let count = self.core.symbols.replace(listing).await;
        debug!(count, "Symbol registry refreshed");
        Ok(count)
    }

    /// Re-query the trader's equity and every follower's.
    pub async fn refresh_equity(&self) -> Result<()> {
        let binance = self.core.exchanges.get(Platform::Binance)?;
        let trader_equity = match self.core.config.trader_equity_source {
            TraderEquitySource::Futures => binance.account_equity(&self.trader).await,
            TraderEquitySource::Wallet => binance.wallet_equity(&self.trader).await,
        }
        .context("Failed to fetch trader equity")?;

        if self.core.equity.update_trader(trader_equity).await {
            info!(equity = %trader_equity, "Trader equity updated");
        }

        for follower in self.core.roster.all().await {
            self.refresh_follower_equity(&follower).await;
        }

        Ok(())
    }

    async fn refresh_follower_equity(&self, follower: &Follower) -> Decimal {
        let client = match self.core.exchanges.get(follower.platform) {
            Ok(client) => client,
            Err(e) => {
                warn!(follower = follower.id, error = %e, "No exchange client");
                return Decimal::ZERO;
            }
        };
        match client.account_equity(&follower.credentials).await {
            Ok(equity) => {
                self.core.equity.update_follower(follower.id, equity).await;
                equity
            }
            Err(e) => {
                warn!(follower = follower.id, error = %e, "Failed to fetch follower equity");
                self.core.equity.follower(follower.id).await
            }
        }
    }

    /// Diff the store's enabled followers against the roster.
    pub async fn sync_followers(&self) -> Result<SyncReport> {
        let desired = self.store.list_active_followers().await?;
        let desired_ids: HashSet<i64> = desired.iter().map(|f| f.id).collect();
        let mut report = SyncReport::default();

        for id in self.core.roster.ids().await {
            if !desired_ids.contains(&id) {
                self.depart(id).await;
                report.departed.push(id);
            }
        }

        for follower in desired {
            match self.core.roster.get(follower.id).await {
                Some(current) => {
                    if self.update_in_place(&current, follower).await {
                        report.updated.push(current.id);
                    }
                }
                None => {
                    let id = follower.id;
                    if self.admit(follower).await {
                        report.admitted.push(id);
                    }
                }
            }
        }

        for id in self.core.workers.dead().await {
            if self.restart(id).await {
                report.restarted.push(id);
            }
        }

        if !report.is_empty() {
            info!(
                admitted = ?report.admitted,
                departed = ?report.departed,
                updated = ?report.updated,
                restarted = ?report.restarted,
                "Roster synced"
            );
        }
        Ok(report)
    }

    async fn update_in_place(&self, current: &Follower, mut fresh: Follower) -> bool {
        // Bootstrap only happens on admission
        fresh.needs_bootstrap = current.needs_bootstrap;
        if *current == fresh {
            return false;
        }

        if current.position_mode != fresh.position_mode {
            if let Err(e) = self.core.bus.set_mode(fresh.id, fresh.position_mode).await {
                error!(follower = fresh.id, error = %e, "Queue missing for roster member");
            }
        }
        debug!(
            follower = fresh.id,
            enablement = ?fresh.enablement,
            ratio = %fresh.equity_ratio,
            mode = %fresh.position_mode,
            "Follower updated"
        );
        self.core.roster.insert(fresh).await;
        true
    }

    /// Bring a follower into the roster: queue, ledger partition, optional
    /// bootstrap, worker.
    pub async fn admit(&self, follower: Follower) -> bool {
        let id = follower.id;
        self.core.roster.insert(follower.clone()).await;
        self.refresh_follower_equity(&follower).await;
        let book = self.core.ledger.partition(id).await;

        let (queue, positions) = {
            let snapshot = self.core.snapshot.read().await;
            let queue = match self.core.bus.bind(id, follower.position_mode).await {
                Ok(queue) => queue,
                Err(e) => {
                    error!(follower = id, error = %e, "Cannot admit follower");
                    self.core.roster.remove(id).await;
                    return false;
                }
            };
            let positions = if follower.needs_bootstrap {
                snapshot.positions()
            } else {
                Vec::new()
            };
            (queue, positions)
        };

        if follower.needs_bootstrap {
            let cleared = FollowerUpdate {
                needs_bootstrap: Some(false),
                ..Default::default()
            };
            match self.store.update_follower(id, &cleared).await {
                Ok(()) => {
                    self.bootstrap(&follower, &positions, &book).await;
                }
                Err(e) => warn!(follower = id, error = %e, "Could not clear bootstrap flag, skipping bootstrap"),
            }
        }

        let worker = Worker::new(queue, book, self.core.roster.clone(), self.core.executor.clone());
        self.core.workers.start(worker).await;

        info!(
            follower = id,
            platform = %follower.platform,
            mode = %follower.position_mode,
            ratio = %follower.equity_ratio,
            "Follower admitted"
        );
        true
    }

    /// Mirror the trader's snapshot onto a new follower with opening orders.
    async fn bootstrap(
        &self,
        follower: &Follower,
        positions: &[TraderPosition],
        book: &SharedBook,
    ) -> usize {
        let trader_equity = self.core.equity.trader().await;
        let follower_equity = self.core.equity.follower(follower.id).await;
        if trader_equity <= Decimal::ZERO || follower_equity <= Decimal::ZERO {
            warn!(
                follower = follower.id,
                trader_equity = %trader_equity,
                follower_equity = %follower_equity,
                "Equity unavailable, bootstrap skipped"
            );
            return 0;
        }

        let mut placed = 0;
        let mut book = book.lock().await;
        for position in positions {
            let Some(direction) = PositionSide::from_sign(position.amount) else {
                continue;
            };
            let intent = Intent::open(position.symbol.clone(), direction, position.amount)
                .for_mode(follower.position_mode);

            match self.core.executor.execute(&intent, follower, &mut book).await {
                Ok(Outcome::Placed { .. }) => placed += 1,
                Ok(Outcome::Skipped(_)) => {}
                Err(e) => warn!(
                    follower = follower.id,
                    symbol = %position.symbol,
                    error = %e,
                    "Bootstrap order failed"
                ),
            }
        }

        info!(follower = follower.id, positions = positions.len(), placed, "Follower bootstrapped");
        placed
    }

    /// Remove a follower: queue, worker, ledger partition, roster entry.
    pub async fn depart(&self, follower_id: i64) {
        match self.core.bus.unbind(follower_id).await {
            Ok(dropped) if dropped > 0 => {
                warn!(follower = follower_id, dropped, "Pending intents dropped on departure")
            }
            Ok(_) => {}
            Err(e) => error!(follower = follower_id, error = %e, "Departing follower had no queue"),
        }
        self.core.workers.stop(follower_id).await;
        let purged = self.core.ledger.purge(follower_id).await;
        self.core.roster.remove(follower_id).await;
        self.core.equity.remove_follower(follower_id).await;

        info!(follower = follower_id, purged, "Follower departed");
    }

    /// Replace a dead worker on a fresh queue; the ledger is kept.
    async fn restart(&self, follower_id: i64) -> bool {
        let Some(follower) = self.core.roster.get(follower_id).await else {
            self.core.workers.stop(follower_id).await;
            return false;
        };

        if let Ok(dropped) = self.core.bus.unbind(follower_id).await {
            if dropped > 0 {
                warn!(follower = follower_id, dropped, "Intents dropped with dead worker");
            }
        }
        self.core.workers.stop(follower_id).await;

        let queue = match self.core.bus.bind(follower_id, follower.position_mode).await {
            Ok(queue) => queue,
            Err(e) => {
                error!(follower = follower_id, error = %e, "Cannot rebind queue");
                return false;
            }
        };
        let book = self.core.ledger.partition(follower_id).await;
        let worker = Worker::new(queue, book, self.core.roster.clone(), self.core.executor.clone());
        let started = self.core.workers.start(worker).await;
        if started {
            warn!(follower = follower_id, "Worker restarted");
        }
        started
    }

    /// Unbind every queue and wait for the workers.
    pub async fn shutdown(&self) {
        for id in self.core.bus.bound().await {
            self.core.bus.unbind(id).await.ok();
        }
        self.core.workers.shutdown().await;
        info!("All workers stopped");
    }
}
