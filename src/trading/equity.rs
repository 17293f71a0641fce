//! Latest known equity of the trader and every follower.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

/// Sizing equities, refreshed on the slow roster cadence.
pub struct EquityBook {
    tolerance: Decimal,
    trader: RwLock<Decimal>,
    followers: RwLock<HashMap<i64, Decimal>>,
}

impl EquityBook {
    pub fn new(tolerance: Decimal) -> Self {
        Self {
            tolerance,
            trader: RwLock::new(Decimal::ZERO),
            followers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn trader(&self) -> Decimal {
        *self.trader.read().await
    }

    pub async fn follower(&self, follower_id: i64) -> Decimal {
        self.followers
            .read()
            .await
            .get(&follower_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Apply a fresh trader equity unless it moved less than the tolerance.
    pub async fn update_trader(&self, value: Decimal) -> bool {
        let mut current = self.trader.write().await;
        if !self.should_replace(*current, value) {
            return false;
        }
        debug!(before = %*current, after = %value, "Trader equity updated");
        *current = value;
        true
    }

    /// Apply a fresh follower equity unless it moved less than the tolerance.
    pub async fn update_follower(&self, follower_id: i64, value: Decimal) -> bool {
        let mut followers = self.followers.write().await;
        let current = followers.get(&follower_id).copied();
        if let Some(current) = current {
            if !self.should_replace(current, value) {
                return false;
            }
        }
        debug!(follower = follower_id, after = %value, "Follower equity updated");
        followers.insert(follower_id, value);
        true
    }

    pub async fn remove_follower(&self, follower_id: i64) {
        self.followers.write().await.remove(&follower_id);
    }

    fn should_replace(&self, current: Decimal, value: Decimal) -> bool {
        // An unset or non-positive value is always replaced
        current <= Decimal::ZERO || (value - current).abs() >= self.tolerance
    }
}
