//! Position ledger: each follower's believed position per symbol and side.
//!
//! The ledger is partitioned physically by follower. A [`FollowerBook`] is
//! handed to that follower's worker, which is its only writer; the outer
//! map only registers and drops partitions. All arithmetic is decimal and
//! results within epsilon of zero are stored as exactly zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::models::PositionSide;

/// Ledger entry key within one follower's partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl LedgerKey {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}&{}", self.symbol, self.side)
    }
}

/// One follower's ledger partition.
#[derive(Debug)]
pub struct FollowerBook {
    follower_id: i64,
    epsilon: Decimal,
    entries: HashMap<LedgerKey, Decimal>,
}

impl FollowerBook {
    pub fn new(follower_id: i64, epsilon: Decimal) -> Self {
        Self {
            follower_id,
            epsilon,
            entries: HashMap::new(),
        }
    }

    pub fn follower_id(&self) -> i64 {
        self.follower_id
    }

    /// Believed quantity; zero when the key was never traded.
    pub fn get(&self, symbol: &str, side: PositionSide) -> Decimal {
        self.entries
            .get(&LedgerKey::new(symbol, side))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Add a signed delta and return the stored result.
    pub fn apply(&mut self, symbol: &str, side: PositionSide, delta: Decimal) -> Decimal {
        let key = LedgerKey::new(symbol, side);
        let current = self.entries.get(&key).copied().unwrap_or(Decimal::ZERO);
        let next = self.clamp(side, current + delta);

        debug!(
            follower = self.follower_id,
            key = %key,
            before = %current,
            delta = %delta,
            after = %next,
            "Ledger update"
        );

        self.entries.insert(key, next);
        next
    }

    /// Set an entry to exactly zero.
    pub fn flatten(&mut self, symbol: &str, side: PositionSide) {
        self.entries.insert(LedgerKey::new(symbol, side), Decimal::ZERO);
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(LedgerKey, Decimal)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Every entry is zero within epsilon.
    pub fn is_flat(&self) -> bool {
        self.entries.values().all(|v| v.abs() <= self.epsilon)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn clamp(&self, side: PositionSide, value: Decimal) -> Decimal {
        if value.abs() <= self.epsilon {
            return Decimal::ZERO;
        }
        // Dual books hold magnitudes
        if side.is_dual() && value < Decimal::ZERO {
            return Decimal::ZERO;
        }
        value
    }
}

pub type SharedBook = Arc<Mutex<FollowerBook>>;

/// Registry of follower partitions.
pub struct Ledger {
    epsilon: Decimal,
    books: RwLock<HashMap<i64, SharedBook>>,
}

impl Ledger {
    pub fn new(epsilon: Decimal) -> Self {
        Self {
            epsilon,
            books: RwLock::new(HashMap::new()),
        }
    }

    /// The follower's partition, created empty on first use.
    pub async fn partition(&self, follower_id: i64) -> SharedBook {
        if let Some(book) = self.books.read().await.get(&follower_id) {
            return book.clone();
        }

        let mut books = self.books.write().await;
        books
            .entry(follower_id)
            .or_insert_with(|| Arc::new(Mutex::new(FollowerBook::new(follower_id, self.epsilon))))
            .clone()
    }

    pub async fn get(&self, follower_id: i64) -> Option<SharedBook> {
        self.books.read().await.get(&follower_id).cloned()
    }

    /// Drop a follower's partition and return how many entries it held.
    pub async fn purge(&self, follower_id: i64) -> usize {
        let removed = self.books.write().await.remove(&follower_id);
        match removed {
            Some(book) => {
                let mut book = book.lock().await;
                let count = book.entries.len();
                book.clear();
                count
            }
            None => 0,
        }
    }

    /// Snapshot of one follower's entries.
    pub async fn positions(&self, follower_id: i64) -> Option<Vec<(LedgerKey, Decimal)>> {
        let book = self.get(follower_id).await?;
        let book = book.lock().await;
        Some(book.entries())
    }
}
