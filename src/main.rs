//! Futures copy-trading engine
//!
//! Mirrors a lead trader's futures positions onto follower accounts on
//! Binance and Gate.io with equity-proportional sizing.

mod admin;
mod api;
mod db;
mod engine;
mod models;
mod trading;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::admin::{AdminService, FollowerRequest};
use crate::api::{BinanceClient, Exchanges, GateClient};
use crate::db::Database;
use crate::engine::{Engine, EngineConfig};
use crate::models::{mask, ApiStatus, Credentials, Enablement, Platform, PositionMode, PositionSide, Side};
use crate::trading::{ManualOrder, ManualSize, Outcome, ReplicationConfig};

/// Futures copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "copier")]
#[command(about = "Replicate a lead trader's futures positions onto follower accounts", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:copier.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication engine
    Run {
        /// Log follower orders instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Roster sync interval in seconds
        #[arg(long, default_value = "30")]
        sync_interval: u64,
    },

    /// Register a follower account
    AddFollower {
        /// Owner reference
        #[arg(long)]
        address: String,

        /// binance or gate
        #[arg(long, default_value = "binance")]
        platform: String,

        #[arg(long)]
        api_key: String,

        #[arg(long)]
        api_secret: String,

        /// Multiplier applied to the account equity
        #[arg(long, default_value = "1")]
        ratio: String,

        /// merged or dual
        #[arg(long, default_value = "merged")]
        mode: String,

        /// Do not mirror the trader's open positions on admission
        #[arg(long)]
        no_bootstrap: bool,
    },

    /// Stop a follower from opening new exposure
    Pause { id: i64 },

    /// Let a paused follower open exposure again
    Resume { id: i64 },

    /// Change a follower's equity ratio
    SetRatio { id: i64, ratio: String },

    /// List every follower's equity ratio
    Ratios,

    /// Enable, disable or park a follower's API binding
    SetStatus {
        id: i64,

        /// enabled, disabled or pending
        status: String,

        /// Mirror the trader's positions when next admitted
        #[arg(long)]
        bootstrap: bool,
    },

    /// Switch a follower's account between merged and dual position mode
    SetMode { id: i64, mode: String },

    /// List stored followers
    Followers,

    /// Show a follower's live exchange positions
    Positions { id: i64 },

    /// Close every position of every enabled follower on a platform
    Flatten { platform: String },

    /// Place an operator-sized order for one follower
    Order {
        id: i64,

        #[arg(long)]
        symbol: String,

        /// buy or sell
        #[arg(long)]
        side: String,

        /// both, long or short
        #[arg(long, default_value = "both")]
        position_side: String,

        /// Coin quantity; omit to close the whole live position
        #[arg(long)]
        quantity: Option<String>,
    },

    /// Import Binance contract metadata into the store
    ImportSymbols,

    /// List stored symbol metadata
    Symbols {
        #[arg(long)]
        platform: Option<String>,
    },

    /// Show current configuration
    Config,
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Ok(Decimal::from_str(raw)?)
}

fn parse_side(raw: &str) -> Result<Side> {
    match raw.to_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => bail!("Unknown side: {}", other),
    }
}

fn parse_position_side(raw: &str) -> Result<PositionSide> {
    match raw.to_lowercase().as_str() {
        "both" | "merged" => Ok(PositionSide::Merged),
        "long" => Ok(PositionSide::Long),
        "short" => Ok(PositionSide::Short),
        other => bail!("Unknown position side: {}", other),
    }
}

fn parse_api_status(raw: &str) -> Result<ApiStatus> {
    match raw.to_lowercase().as_str() {
        "enabled" | "1" => Ok(ApiStatus::Enabled),
        "disabled" | "2" => Ok(ApiStatus::Disabled),
        "pending" | "3" => Ok(ApiStatus::Pending),
        other => bail!("Unknown api status: {}", other),
    }
}

fn exchanges() -> Result<Exchanges> {
    Ok(Exchanges::new()
        .with(Arc::new(BinanceClient::new()?))
        .with(Arc::new(GateClient::new()?)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let replication = ReplicationConfig::from_env()?;
    let db = Arc::new(Database::new(&cli.database).await?);

    let admin = AdminService::detached(db.clone(), exchanges()?, replication.clone());

    match cli.command {
        Commands::Run {
            dry_run,
            sync_interval,
        } => {
            let trader = Credentials::from_env("TRADER")?;
            info!(dry_run, trader = %mask(&trader.api_key), "Starting replication engine");

            let config = EngineConfig {
                follower_sync_secs: sync_interval,
                dry_run,
                database_url: cli.database.clone(),
                replication,
                ..Default::default()
            };

            let mut engine = Engine::new(config, trader).await?;
            engine.initialize().await?;

            println!("\n=== Futures Copy Engine ===");
            println!("Mode: {}", if dry_run { "DRY RUN (orders logged only)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let attached = AdminService::attached(db.clone(), engine.core());
            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Engine error");
            }

            // Show what each follower was believed to hold at shutdown
            println!("\n{}", engine.stats().await);
            for row in attached.list_ratios().await? {
                if let Ok(entries) = attached.ledger_positions(row.id).await {
                    for (key, quantity) in entries {
                        println!("  follower {:<6} {:<24} {}", row.id, key, quantity);
                    }
                }
            }
        }

        Commands::AddFollower {
            address,
            platform,
            api_key,
            api_secret,
            ratio,
            mode,
            no_bootstrap,
        } => {
            let id = admin
                .add_follower(FollowerRequest {
                    address,
                    platform: platform.parse()?,
                    credentials: Credentials::new(api_key, api_secret),
                    equity_ratio: parse_decimal(&ratio)?,
                    bootstrap: !no_bootstrap,
                    position_mode: mode.parse()?,
                })
                .await?;
            println!("Follower {} added", id);
        }

        Commands::Pause { id } => {
            admin.set_enablement(id, Enablement::Paused).await?;
            println!("Follower {} paused", id);
        }

        Commands::Resume { id } => {
            admin.set_enablement(id, Enablement::Active).await?;
            println!("Follower {} resumed", id);
        }

        Commands::SetRatio { id, ratio } => {
            let ratio = parse_decimal(&ratio)?;
            admin.set_equity_ratio(id, ratio).await?;
            println!("Follower {} ratio set to {}", id, ratio);
        }

        Commands::Ratios => {
            println!("\n{:<6} {:<16} {:>10}", "ID", "API KEY", "RATIO");
            println!("{}", "-".repeat(34));
            for row in admin.list_ratios().await? {
                println!("{:<6} {:<16} {:>10}", row.id, row.api_key, row.equity_ratio);
            }
        }

        Commands::SetStatus {
            id,
            status,
            bootstrap,
        } => {
            let status = parse_api_status(&status)?;
            admin.set_api_status(id, status, bootstrap).await?;
            println!("Follower {} status set to {:?}", id, status);
        }

        Commands::SetMode { id, mode } => {
            let mode: PositionMode = mode.parse()?;
            admin.set_position_mode(id, mode).await?;
            println!("Follower {} switched to {} mode", id, mode);
        }

        Commands::Followers => {
            let followers = db.list_followers().await?;
            if followers.is_empty() {
                println!("No followers registered. Use 'copier add-follower' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<8} {:<16} {:>8} {:<8} {:<8} {:<6}",
                "ID", "VENUE", "API KEY", "RATIO", "STATUS", "MODE", "INIT"
            );
            println!("{}", "-".repeat(68));
            for row in followers {
                let status = row
                    .status()
                    .map(|s| format!("{:?}", s))
                    .unwrap_or_else(|_| row.api_status.to_string());
                let enablement = Enablement::from_open_status(row.open_status);
                println!(
                    "{:<6} {:<8} {:<16} {:>8} {:<8} {:<8} {:<6}",
                    row.id,
                    row.platform,
                    mask(&row.api_key),
                    row.equity_ratio,
                    if enablement == Enablement::Active { status } else { format!("{} (paused)", status) },
                    row.position_mode,
                    row.need_init == 1,
                );
            }
        }

        Commands::Positions { id } => {
            let positions = admin.live_positions(id).await?;
            if positions.is_empty() {
                println!("Follower {} has no open positions", id);
                return Ok(());
            }
            println!("\n{:<16} {:<6} {:>16}", "SYMBOL", "SIDE", "QUANTITY");
            println!("{}", "-".repeat(40));
            for p in positions {
                println!("{:<16} {:<6} {:>16}", p.symbol, p.side, p.quantity);
            }
        }

        Commands::Flatten { platform } => {
            let platform: Platform = platform.parse()?;
            let results = admin.flatten_platform(platform).await?;
            for r in &results {
                match &r.error {
                    None => println!("Follower {}: {} closing orders", r.follower_id, r.orders),
                    Some(e) => println!("Follower {}: failed ({})", r.follower_id, e),
                }
            }
            println!("Flattened {} followers on {}", results.len(), platform);
        }

        Commands::Order {
            id,
            symbol,
            side,
            position_side,
            quantity,
        } => {
            let size = match quantity {
                Some(q) => ManualSize::Coins(parse_decimal(&q)?),
                None => ManualSize::CloseAll,
            };
            let order = ManualOrder {
                symbol: symbol.to_uppercase(),
                side: parse_side(&side)?,
                position_side: parse_position_side(&position_side)?,
                size,
            };
            // The engine's ledger lives in its own process
            match admin.manual_order(id, &order, false).await? {
                Outcome::Placed {
                    order_id, quantity, ..
                } => println!("Order {} placed for {} {}", order_id, quantity, order.symbol),
                Outcome::Skipped(reason) => println!("Order skipped: {}", reason),
            }
        }

        Commands::ImportSymbols => {
            let binance = BinanceClient::new()?;
            let count = admin.import_symbols(Platform::Binance, &binance).await?;
            println!("Imported {} symbols", count);
        }

        Commands::Symbols { platform } => {
            let platform = platform.map(|p| p.parse::<Platform>()).transpose()?;
            let symbols = db.get_symbols(platform).await?;
            println!(
                "\n{:<8} {:<16} {:<8} {:>5} {:>5} {:>12}",
                "VENUE", "SYMBOL", "COIN", "QTY", "PX", "MULTIPLIER"
            );
            println!("{}", "-".repeat(60));
            for s in symbols {
                println!(
                    "{:<8} {:<16} {:<8} {:>5} {:>5} {:>12}",
                    s.platform, s.symbol, s.coin, s.quantity_precision, s.price_precision, s.contract_multiplier
                );
            }
        }

        Commands::Config => {
            let engine = EngineConfig::default();

            println!("\n=== Replication Configuration ===\n");
            println!("  Epsilon:              {}", replication.epsilon);
            println!("  Equity Tolerance:     {}", replication.equity_tolerance);
            println!("  Follower Capacity:    {}", replication.follower_capacity);
            println!("  Flatten Pause:        {}ms", replication.flatten_pause_ms);
            println!("  Trader Equity:        {:?}", replication.trader_equity_source);

            println!("\n=== Engine Cadence ===\n");
            println!("  Symbol Refresh:       {}s", engine.symbol_refresh_secs);
            println!("  Equity Refresh:       {}s", engine.equity_refresh_secs);
            println!("  Follower Sync:        {}s", engine.follower_sync_secs);
        }
    }

    Ok(())
}
