//! Administrative operations on followers, positions and symbol metadata.
//!
//! Every call returns a structured [`AdminRejection`] rather than an
//! internal error. The service either runs attached to a live
//! [`ReplicationCore`] (ledger queries and tracked orders available) or
//! detached from it, as the CLI does.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{BinanceClient, ExchangePosition, ExchangeSymbol, Exchanges};
use crate::db::{Database, FollowerStore, FollowerUpdate, NewFollower};
use crate::models::{
    mask, ApiStatus, Credentials, Enablement, Follower, Platform, PositionMode, SymbolInfo,
};
use crate::trading::{
    EquityBook, LedgerKey, ManualOrder, Outcome, ReplicationConfig, ReplicationCore,
    ReplicationExecutor, SymbolRegistry,
};

/// Reason an administrative call was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdminRejection {
    #[error("equity ratio must be positive, got {0}")]
    InvalidRatio(Decimal),

    #[error("api key {0} is already registered")]
    Duplicate(String),

    #[error("follower capacity of {0} reached")]
    CapacityExceeded(i64),

    #[error("follower {0} not found")]
    NotFound(i64),

    #[error("follower {0} still has open positions")]
    PositionsOpen(i64),

    #[error("ledger is only available while the engine is running")]
    LedgerUnavailable,

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("store error: {0}")]
    Store(String),
}

fn store_error(e: anyhow::Error) -> AdminRejection {
    AdminRejection::Store(format!("{:#}", e))
}

fn exchange_error(e: anyhow::Error) -> AdminRejection {
    AdminRejection::Exchange(format!("{:#}", e))
}

/// Follower to register.
#[derive(Debug, Clone)]
pub struct FollowerRequest {
    pub address: String,
    pub platform: Platform,
    pub credentials: Credentials,
    pub equity_ratio: Decimal,
    pub bootstrap: bool,
    pub position_mode: PositionMode,
}

/// One row of [`AdminService::list_ratios`].
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerRatio {
    pub id: i64,
    /// Masked API key
    pub api_key: String,
    pub equity_ratio: Decimal,
}

/// Result of closing one follower's positions.
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenResult {
    pub follower_id: i64,
    pub orders: usize,
    pub error: Option<String>,
}

pub struct AdminService {
    db: Arc<Database>,
    exchanges: Exchanges,
    config: ReplicationConfig,
    symbols: Arc<SymbolRegistry>,
    executor: Arc<ReplicationExecutor>,
    core: Option<Arc<ReplicationCore>>,
}

impl AdminService {
    /// Service without a running engine: store and exchange access only.
    pub fn detached(db: Arc<Database>, exchanges: Exchanges, config: ReplicationConfig) -> Self {
        let symbols = Arc::new(SymbolRegistry::new());
        let executor = Arc::new(ReplicationExecutor::new(
            exchanges.clone(),
            symbols.clone(),
            Arc::new(EquityBook::new(config.equity_tolerance)),
            config.epsilon,
        ));
        Self {
            db,
            exchanges,
            config,
            symbols,
            executor,
            core: None,
        }
    }

    /// Service sharing the engine's ledger, registry and executor.
    pub fn attached(db: Arc<Database>, core: Arc<ReplicationCore>) -> Self {
        Self {
            db,
            exchanges: core.exchanges.clone(),
            config: core.config.clone(),
            symbols: core.symbols.clone(),
            executor: core.executor.clone(),
            core: Some(core),
        }
    }

    async fn follower(&self, id: i64) -> Result<Follower, AdminRejection> {
        self.db
            .get_follower(id)
            .await
            .map_err(store_error)?
            .ok_or(AdminRejection::NotFound(id))?
            .into_follower()
            .map_err(store_error)
    }

    async fn update(&self, id: i64, update: FollowerUpdate) -> Result<(), AdminRejection> {
        self.follower(id).await?;
        self.db.update_follower(id, &update).await.map_err(store_error)
    }

    /// A detached service loads symbol metadata on demand; the engine keeps
    /// its own registry fresh.
    async fn load_symbols(&self) -> Result<(), AdminRejection> {
        if self.core.is_none() {
            let listing = self.db.list_symbols().await.map_err(store_error)?;
            self.symbols.replace(listing).await;
        }
        Ok(())
    }

    // ==================== Followers ====================

    pub async fn add_follower(&self, request: FollowerRequest) -> Result<i64, AdminRejection> {
        if request.equity_ratio <= Decimal::ZERO {
            return Err(AdminRejection::InvalidRatio(request.equity_ratio));
        }
        let existing = self
            .db
            .find_by_api_key(&request.credentials.api_key)
            .await
            .map_err(store_error)?;
        if existing.is_some() {
            return Err(AdminRejection::Duplicate(mask(&request.credentials.api_key)));
        }
        let occupied = self.db.count_occupying().await.map_err(store_error)?;
        if occupied >= self.config.follower_capacity {
            return Err(AdminRejection::CapacityExceeded(self.config.follower_capacity));
        }

        let id = self
            .db
            .insert_follower(&NewFollower {
                address: request.address,
                platform: request.platform,
                credentials: request.credentials.clone(),
                equity_ratio: request.equity_ratio,
                needs_bootstrap: request.bootstrap,
                position_mode: request.position_mode,
            })
            .await
            .map_err(store_error)?;

        info!(
            follower = id,
            platform = %request.platform,
            api_key = %mask(&request.credentials.api_key),
            "Follower added"
        );
        Ok(id)
    }

    pub async fn set_enablement(&self, id: i64, enablement: Enablement) -> Result<(), AdminRejection> {
        self.update(
            id,
            FollowerUpdate {
                enablement: Some(enablement),
                ..Default::default()
            },
        )
        .await?;
        info!(follower = id, enablement = ?enablement, "Enablement changed");
        Ok(())
    }

    pub async fn set_equity_ratio(&self, id: i64, ratio: Decimal) -> Result<(), AdminRejection> {
        if ratio <= Decimal::ZERO {
            return Err(AdminRejection::InvalidRatio(ratio));
        }
        self.update(
            id,
            FollowerUpdate {
                equity_ratio: Some(ratio),
                ..Default::default()
            },
        )
        .await?;
        info!(follower = id, ratio = %ratio, "Equity ratio changed");
        Ok(())
    }

    pub async fn list_ratios(&self) -> Result<Vec<FollowerRatio>, AdminRejection> {
        let rows = self.db.list_followers().await.map_err(store_error)?;
        rows.into_iter()
            .map(|row| {
                let id = row.id;
                let follower = row.into_follower().map_err(store_error)?;
                Ok(FollowerRatio {
                    id,
                    api_key: mask(&follower.credentials.api_key),
                    equity_ratio: follower.equity_ratio,
                })
            })
            .collect()
    }

    /// Change the API binding; only a flat follower may change status.
    pub async fn set_api_status(
        &self,
        id: i64,
        status: ApiStatus,
        bootstrap: bool,
    ) -> Result<(), AdminRejection> {
        let stored = self
            .db
            .get_follower(id)
            .await
            .map_err(store_error)?
            .ok_or(AdminRejection::NotFound(id))?;
        let current = stored.status().map_err(store_error)?;
        let follower = stored.into_follower().map_err(store_error)?;

        if !self.is_flat(&follower).await? {
            return Err(AdminRejection::PositionsOpen(id));
        }
        if status.occupies_slot() && !current.occupies_slot() {
            let occupied = self.db.count_occupying().await.map_err(store_error)?;
            if occupied >= self.config.follower_capacity {
                return Err(AdminRejection::CapacityExceeded(self.config.follower_capacity));
            }
        }

        self.db
            .update_follower(
                id,
                &FollowerUpdate {
                    api_status: Some(status),
                    needs_bootstrap: Some(bootstrap),
                    ..Default::default()
                },
            )
            .await
            .map_err(store_error)?;
        info!(follower = id, status = ?status, bootstrap, "Api status changed");
        Ok(())
    }

    async fn is_flat(&self, follower: &Follower) -> Result<bool, AdminRejection> {
        match &self.core {
            Some(core) => match core.ledger.get(follower.id).await {
                Some(book) => Ok(book.lock().await.is_flat()),
                None => Ok(true),
            },
            None => Ok(self.live_positions_of(follower).await?.is_empty()),
        }
    }

    /// Switch a flat follower's account on the exchange, then record the mode.
    pub async fn set_position_mode(&self, id: i64, mode: PositionMode) -> Result<(), AdminRejection> {
        let follower = self.follower(id).await?;
        if !self.is_flat(&follower).await? {
            return Err(AdminRejection::PositionsOpen(id));
        }
        let client = self.exchanges.get(follower.platform).map_err(exchange_error)?;
        client
            .set_dual_mode(&follower.credentials, mode == PositionMode::Dual)
            .await
            .map_err(exchange_error)?;

        self.db
            .update_follower(
                id,
                &FollowerUpdate {
                    position_mode: Some(mode),
                    ..Default::default()
                },
            )
            .await
            .map_err(store_error)?;
        info!(follower = id, mode = %mode, "Position mode changed");
        Ok(())
    }

    // ==================== Positions ====================

    /// Ledger entries of a follower the engine is tracking.
    pub async fn ledger_positions(&self, id: i64) -> Result<Vec<(LedgerKey, Decimal)>, AdminRejection> {
        let core = self.core.as_ref().ok_or(AdminRejection::LedgerUnavailable)?;
        core.ledger
            .positions(id)
            .await
            .ok_or(AdminRejection::NotFound(id))
    }

    pub async fn live_positions(&self, id: i64) -> Result<Vec<ExchangePosition>, AdminRejection> {
        let follower = self.follower(id).await?;
        self.live_positions_of(&follower).await
    }

    async fn live_positions_of(&self, follower: &Follower) -> Result<Vec<ExchangePosition>, AdminRejection> {
        let client = self.exchanges.get(follower.platform).map_err(exchange_error)?;
        client
            .positions(&follower.credentials)
            .await
            .map_err(exchange_error)
    }

    /// Close every live position of every enabled follower on `platform`.
    pub async fn flatten_platform(&self, platform: Platform) -> Result<Vec<FlattenResult>, AdminRejection> {
        self.load_symbols().await?;
        let followers: Vec<Follower> = self
            .db
            .list_active_followers()
            .await
            .map_err(store_error)?
            .into_iter()
            .filter(|f| f.platform == platform)
            .collect();

        let pause = Duration::from_millis(self.config.flatten_pause_ms);
        let mut results = Vec::with_capacity(followers.len());

        for (i, follower) in followers.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let result = match self.executor.flatten(follower).await {
                Ok(closes) => {
                    let book = match &self.core {
                        Some(core) => core.ledger.get(follower.id).await,
                        None => None,
                    };
                    let mut orders = 0;
                    let mut failures = Vec::new();
                    for close in closes {
                        match close.result {
                            Ok(_) => {
                                orders += 1;
                                if let Some(book) = &book {
                                    book.lock().await.flatten(&close.symbol, close.side);
                                }
                            }
                            Err(e) => failures.push(format!("{} {}: {:#}", close.symbol, close.side, e)),
                        }
                    }
                    FlattenResult {
                        follower_id: follower.id,
                        orders,
                        error: (!failures.is_empty()).then(|| failures.join("; ")),
                    }
                }
                Err(e) => {
                    warn!(follower = follower.id, error = %e, "Flatten failed");
                    FlattenResult {
                        follower_id: follower.id,
                        orders: 0,
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            results.push(result);
        }

        info!(platform = %platform, followers = results.len(), "Platform flattened");
        Ok(results)
    }

    /// Operator-sized order; `track` moves the engine's ledger with it.
    pub async fn manual_order(
        &self,
        id: i64,
        order: &ManualOrder,
        track: bool,
    ) -> Result<Outcome, AdminRejection> {
        let follower = self.follower(id).await?;
        self.load_symbols().await?;

        if !track {
            return self
                .executor
                .manual_order(&follower, order, None)
                .await
                .map_err(exchange_error);
        }

        let core = self.core.as_ref().ok_or(AdminRejection::LedgerUnavailable)?;
        let book = core
            .ledger
            .get(id)
            .await
            .ok_or(AdminRejection::LedgerUnavailable)?;
        let mut book = book.lock().await;
        self.executor
            .manual_order(&follower, order, Some(&mut book))
            .await
            .map_err(exchange_error)
    }

    // ==================== Symbols ====================

    /// Pull the venue's contract listing into the store.
    pub async fn import_symbols(&self, platform: Platform, source: &BinanceClient) -> Result<usize, AdminRejection> {
        if platform != Platform::Binance {
            return Err(AdminRejection::Unsupported(format!("symbol import for {}", platform)));
        }
        let listing = source.exchange_info().await.map_err(exchange_error)?;
        self.store_listing(listing).await
    }

    async fn store_listing(&self, listing: Vec<ExchangeSymbol>) -> Result<usize, AdminRejection> {
        let mut imported = 0;
        for entry in listing {
            let info = SymbolInfo {
                platform: Platform::Binance,
                symbol: entry.symbol,
                coin: entry.base_asset,
                quantity_precision: entry.quantity_precision,
                contract_multiplier: Decimal::ZERO,
            };
            self.db
                .upsert_symbol(&info, entry.price_precision)
                .await
                .map_err(store_error)?;
            imported += 1;
        }
        info!(imported, "Symbols imported");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use crate::models::{PositionSide, Side};
    use crate::trading::ManualSize;
    use rust_decimal_macros::dec;

    async fn setup(capacity: i64) -> (Arc<MockExchange>, Arc<Database>, AdminService) {
        let exchange = Arc::new(MockExchange::new(Platform::Binance));
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.upsert_symbol(
            &SymbolInfo {
                platform: Platform::Binance,
                symbol: "BTCUSDT".to_string(),
                coin: "BTC".to_string(),
                quantity_precision: 3,
                contract_multiplier: Decimal::ZERO,
            },
            1,
        )
        .await
        .unwrap();

        let config = ReplicationConfig {
            follower_capacity: capacity,
            flatten_pause_ms: 0,
            ..Default::default()
        };
        let service = AdminService::detached(db.clone(), Exchanges::new().with(exchange.clone()), config);
        (exchange, db, service)
    }

    fn request(key: &str, ratio: Decimal) -> FollowerRequest {
        FollowerRequest {
            address: format!("owner-{}", key),
            platform: Platform::Binance,
            credentials: Credentials::new(key, "secret"),
            equity_ratio: ratio,
            bootstrap: true,
            position_mode: PositionMode::Merged,
        }
    }

    #[tokio::test]
    async fn test_add_follower_rejections() {
        let (_, _, service) = setup(2).await;

        assert!(matches!(
            service.add_follower(request("key-a", dec!(0))).await,
            Err(AdminRejection::InvalidRatio(_))
        ));

        service.add_follower(request("key-a", dec!(1))).await.unwrap();
        assert!(matches!(
            service.add_follower(request("key-a", dec!(1))).await,
            Err(AdminRejection::Duplicate(_))
        ));

        service.add_follower(request("key-b", dec!(1))).await.unwrap();
        assert_eq!(
            service.add_follower(request("key-c", dec!(1))).await,
            Err(AdminRejection::CapacityExceeded(2))
        );
    }

    #[tokio::test]
    async fn test_pause_and_ratio_are_stored() {
        let (_, db, service) = setup(35).await;
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();

        service.set_enablement(id, Enablement::Paused).await.unwrap();
        service.set_equity_ratio(id, dec!(0.5)).await.unwrap();
        assert!(matches!(
            service.set_equity_ratio(id, dec!(-1)).await,
            Err(AdminRejection::InvalidRatio(_))
        ));

        let follower = db.get_follower(id).await.unwrap().unwrap().into_follower().unwrap();
        assert_eq!(follower.enablement, Enablement::Paused);
        assert_eq!(follower.equity_ratio, dec!(0.5));

        let ratios = service.list_ratios().await.unwrap();
        assert_eq!(ratios.len(), 1);
        assert_eq!(ratios[0].equity_ratio, dec!(0.5));
        assert_ne!(ratios[0].api_key, "key-a");

        assert_eq!(
            service.set_enablement(99, Enablement::Active).await,
            Err(AdminRejection::NotFound(99))
        );
    }

    #[tokio::test]
    async fn test_status_change_requires_flat_account() {
        let (exchange, db, service) = setup(35).await;
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();
        exchange
            .set_positions(
                "key-a",
                vec![ExchangePosition {
                    symbol: "BTCUSDT".to_string(),
                    side: PositionSide::Merged,
                    quantity: dec!(0.01),
                }],
            )
            .await;

        assert_eq!(
            service.set_api_status(id, ApiStatus::Disabled, false).await,
            Err(AdminRejection::PositionsOpen(id))
        );

        exchange.set_positions("key-a", Vec::new()).await;
        service.set_api_status(id, ApiStatus::Disabled, false).await.unwrap();
        let stored = db.get_follower(id).await.unwrap().unwrap();
        assert_eq!(stored.api_status, 2);
        assert_eq!(stored.need_init, 0);
    }

    #[tokio::test]
    async fn test_position_mode_switches_exchange_first() {
        let (exchange, db, service) = setup(35).await;
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();
        exchange
            .set_positions(
                "key-a",
                vec![ExchangePosition {
                    symbol: "BTCUSDT".to_string(),
                    side: PositionSide::Merged,
                    quantity: dec!(0.01),
                }],
            )
            .await;

        assert_eq!(
            service.set_position_mode(id, PositionMode::Dual).await,
            Err(AdminRejection::PositionsOpen(id))
        );
        assert_eq!(exchange.dual_mode("key-a").await, None);

        exchange.set_positions("key-a", Vec::new()).await;
        service.set_position_mode(id, PositionMode::Dual).await.unwrap();
        assert_eq!(exchange.dual_mode("key-a").await, Some(true));
        let stored = db.get_follower(id).await.unwrap().unwrap();
        assert_eq!(stored.position_mode, "dual");
    }

    #[tokio::test]
    async fn test_ledger_calls_need_engine() {
        let (_, _, service) = setup(35).await;
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();

        assert_eq!(service.ledger_positions(id).await, Err(AdminRejection::LedgerUnavailable));

        let order = ManualOrder {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            position_side: PositionSide::Merged,
            size: ManualSize::Coins(dec!(0.01)),
        };
        assert_eq!(
            service.manual_order(id, &order, true).await,
            Err(AdminRejection::LedgerUnavailable)
        );
    }

    #[tokio::test]
    async fn test_attached_service_reads_and_moves_ledger() {
        let (exchange, db, _) = setup(35).await;
        let core = Arc::new(ReplicationCore::new(
            Exchanges::new().with(exchange.clone()),
            ReplicationConfig::default(),
        ));
        core.symbols.replace(db.list_symbols().await.unwrap()).await;
        let service = AdminService::attached(db.clone(), core.clone());
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();

        assert_eq!(service.ledger_positions(id).await, Err(AdminRejection::NotFound(id)));

        let book = core.ledger.partition(id).await;
        book.lock().await.apply("BTCUSDT", PositionSide::Merged, dec!(-0.02));
        assert_eq!(
            service.ledger_positions(id).await.unwrap(),
            vec![(LedgerKey::new("BTCUSDT", PositionSide::Merged), dec!(-0.02))]
        );
        assert_eq!(
            service.set_api_status(id, ApiStatus::Disabled, false).await,
            Err(AdminRejection::PositionsOpen(id))
        );

        let order = ManualOrder {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            position_side: PositionSide::Merged,
            size: ManualSize::Coins(dec!(0.02)),
        };
        let outcome = service.manual_order(id, &order, true).await.unwrap();
        assert!(matches!(outcome, Outcome::Placed { ledger, .. } if ledger.is_zero()));
        assert!(book.lock().await.is_flat());
    }

    #[tokio::test]
    async fn test_untracked_manual_order() {
        let (exchange, _, service) = setup(35).await;
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();

        let order = ManualOrder {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            position_side: PositionSide::Merged,
            size: ManualSize::Coins(dec!(0.0125)),
        };
        let outcome = service.manual_order(id, &order, false).await.unwrap();
        assert!(matches!(outcome, Outcome::Placed { quantity, .. } if quantity == dec!(0.013)));
        assert_eq!(exchange.orders_for("key-a").await[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn test_flatten_platform_closes_live_positions() {
        let (exchange, _, service) = setup(35).await;
        service.add_follower(request("key-a", dec!(1))).await.unwrap();
        service.add_follower(request("key-b", dec!(1))).await.unwrap();
        exchange
            .set_positions(
                "key-a",
                vec![ExchangePosition {
                    symbol: "BTCUSDT".to_string(),
                    side: PositionSide::Merged,
                    quantity: dec!(-0.02),
                }],
            )
            .await;

        let results = service.flatten_platform(Platform::Binance).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].orders, 1);
        assert_eq!(results[1].orders, 0);

        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert!(orders[0].reduce_only);
        assert!(orders[0].close);
    }

    #[tokio::test]
    async fn test_failed_flatten_keeps_ledger() {
        let (exchange, db, _) = setup(35).await;
        let core = Arc::new(ReplicationCore::new(
            Exchanges::new().with(exchange.clone()),
            ReplicationConfig {
                flatten_pause_ms: 0,
                ..Default::default()
            },
        ));
        core.symbols.replace(db.list_symbols().await.unwrap()).await;
        let service = AdminService::attached(db.clone(), core.clone());
        let id = service.add_follower(request("key-a", dec!(1))).await.unwrap();

        let book = core.ledger.partition(id).await;
        book.lock().await.apply("BTCUSDT", PositionSide::Merged, dec!(0.5));
        exchange
            .set_positions(
                "key-a",
                vec![ExchangePosition {
                    symbol: "BTCUSDT".to_string(),
                    side: PositionSide::Merged,
                    quantity: dec!(0.5),
                }],
            )
            .await;

        exchange.fail_orders(true).await;
        let results = service.flatten_platform(Platform::Binance).await.unwrap();
        assert_eq!(results[0].orders, 0);
        assert!(results[0].error.as_deref().is_some_and(|e| e.contains("BTCUSDT")));
        assert_eq!(book.lock().await.get("BTCUSDT", PositionSide::Merged), dec!(0.5));

        exchange.fail_orders(false).await;
        let results = service.flatten_platform(Platform::Binance).await.unwrap();
        assert_eq!(results[0].orders, 1);
        assert_eq!(results[0].error, None);
        assert!(book.lock().await.is_flat());
    }

    #[tokio::test]
    async fn test_stored_listing() {
        let (_, db, service) = setup(35).await;
        let listing = vec![ExchangeSymbol {
            symbol: "ETHUSDT".to_string(),
            base_asset: "ETH".to_string(),
            quote_asset: "USDT".to_string(),
            status: "TRADING".to_string(),
            contract_type: "PERPETUAL".to_string(),
            quantity_precision: 3,
            price_precision: 2,
        }];
        assert_eq!(service.store_listing(listing).await.unwrap(), 1);

        let symbols = db.get_symbols(Some(Platform::Binance)).await.unwrap();
        assert!(symbols.iter().any(|s| s.symbol == "ETHUSDT" && s.quantity_precision == 3));
    }
}
