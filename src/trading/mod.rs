//! Replication core: trader tracking, fan-out, per-follower execution.

pub mod bus;
mod config;
mod equity;
pub mod executor;
pub mod ledger;
mod registry;
mod roster;
mod sizing;
mod tracker;
mod worker;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::api::Exchanges;

pub use bus::FanoutBus;
pub use config::ReplicationConfig;
pub use equity::EquityBook;
pub use executor::{ManualOrder, ManualSize, Outcome, ReplicationExecutor};
pub use ledger::{Ledger, LedgerKey};
pub use registry::SymbolRegistry;
pub use roster::{Roster, RosterSync};
pub use tracker::{PositionSnapshot, PositionTracker, SharedSnapshot};
pub use worker::WorkerPool;

/// State shared by the tracker, the roster sync, the workers and the admin
/// surface.
pub struct ReplicationCore {
    pub config: ReplicationConfig,
    pub exchanges: Exchanges,
    pub symbols: Arc<SymbolRegistry>,
    pub equity: Arc<EquityBook>,
    pub ledger: Arc<Ledger>,
    pub bus: Arc<FanoutBus>,
    pub workers: Arc<WorkerPool>,
    pub roster: Arc<Roster>,
    pub snapshot: SharedSnapshot,
    pub executor: Arc<ReplicationExecutor>,
}

impl ReplicationCore {
    pub fn new(exchanges: Exchanges, config: ReplicationConfig) -> Self {
        let symbols = Arc::new(SymbolRegistry::new());
        let equity = Arc::new(EquityBook::new(config.equity_tolerance));
        let executor = Arc::new(ReplicationExecutor::new(
            exchanges.clone(),
            symbols.clone(),
            equity.clone(),
            config.epsilon,
        ));

        Self {
            ledger: Arc::new(Ledger::new(config.epsilon)),
            bus: Arc::new(FanoutBus::new()),
            workers: Arc::new(WorkerPool::new()),
            roster: Arc::new(Roster::new()),
            snapshot: Arc::new(RwLock::new(PositionSnapshot::default())),
            symbols,
            equity,
            executor,
            exchanges,
            config,
        }
    }

    /// A tracker writing to this core's snapshot and bus.
    pub fn tracker(&self) -> PositionTracker {
        PositionTracker::new(self.snapshot.clone(), self.bus.clone(), self.config.epsilon)
    }
}
