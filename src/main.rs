//! Trailing-Stop Position Manager CLI
//!
//! Monitors spot positions for trailing-stop exits.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use trailguard::{
    Config, ManagerConfig, MarketDataFeed, OpsWebhook, OrderGateway, PositionManager,
    PositionStatus, PositionStore, RestFeed, RestGateway,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "trailguard")]
#[command(about = "Trailing-stop position lifecycle manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor all open positions until interrupted
    Run,

    /// Buy into a position and put it under management
    Open {
        /// Trading pair, e.g. BTCUSDT
        symbol: String,

        /// Quote currency amount to spend
        #[arg(short, long, default_value = "50")]
        amount: Decimal,
    },

    /// Show open positions
    Positions,

    /// Show trade statistics
    Stats {
        /// Number of recent trades to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Clear the manual-intervention flag on a position
    Clear {
        /// Trading pair, e.g. BTCUSDT
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    match cli.command {
        Commands::Run => run_engine(&config).await?,
        Commands::Open { symbol, amount } => open_position(&config, &symbol, amount).await?,
        Commands::Positions => show_positions(&config).await?,
        Commands::Stats { limit } => show_stats(&config, limit).await?,
        Commands::Clear { symbol } => clear_flag(&config, &symbol).await?,
    }

    Ok(())
}

fn build_manager(config: &Config, store: Arc<PositionStore>) -> PositionManager {
    let feed: Arc<dyn MarketDataFeed> = Arc::new(RestFeed::new(config.exchange_base_url.clone()));
    let gateway: Arc<dyn OrderGateway> = Arc::new(RestGateway::new(
        config.exchange_base_url.clone(),
        Duration::from_secs(config.order_timeout_seconds),
    ));
    let alerts = config
        .alert_webhook_url
        .clone()
        .map(|url| Arc::new(OpsWebhook::new(url)));

    PositionManager::new(store, feed, gateway, alerts, ManagerConfig::from(config))
}

async fn run_engine(config: &Config) -> Result<()> {
    println!("\n{}", "=".repeat(70));
    println!("  TRAILING-STOP POSITION MANAGER");
    println!(
        "  Trailing: {}% | Poll: {}s | Escalation after {} failed exits",
        config.trailing_percent, config.poll_interval_seconds, config.max_exit_failures
    );
    if config.alert_webhook_url.is_some() {
        println!("  Operator Webhook: ENABLED");
    }
    println!("{}\n", "=".repeat(70));

    let store = Arc::new(PositionStore::new(&config.database_path).await?);
    let manager = build_manager(config, store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, finishing in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });

    println!("Monitoring positions (Ctrl+C to stop)...\n");
    manager.run(shutdown_rx).await;

    Ok(())
}

async fn open_position(config: &Config, symbol: &str, amount: Decimal) -> Result<()> {
    let store = Arc::new(PositionStore::new(&config.database_path).await?);
    let manager = build_manager(config, store);

    let position = manager
        .open_position(&symbol.to_uppercase(), amount)
        .await?;

    println!(
        "\nOpened {} {} at {} | stop {} ({}% below peak)",
        position.quantity,
        position.symbol,
        position.entry_price,
        position.trailing_stop_price,
        config.trailing_percent
    );
    println!("Start `trailguard run` to put it under monitoring.");

    Ok(())
}

async fn show_positions(config: &Config) -> Result<()> {
    let store = PositionStore::new(&config.database_path).await?;
    let feed = RestFeed::new(config.exchange_base_url.clone());

    let positions = store.list_active().await?;
    if positions.is_empty() {
        println!("No open positions.");
        return Ok(());
    }

    println!("\n{}", "=".repeat(70));
    println!("  OPEN POSITIONS");
    println!("{}\n", "=".repeat(70));
    println!(
        "{:<12} {:>12} {:>12} {:>12} {:>12} {:>10}",
        "SYMBOL", "QTY", "ENTRY", "PEAK", "STOP", "STATUS"
    );
    println!("{}", "-".repeat(70));

    for position in &positions {
        let status = if position.needs_attention {
            "ATTENTION".red()
        } else {
            match position.status {
                PositionStatus::Active => "Active".green(),
                PositionStatus::Exiting => "Exiting".yellow(),
                PositionStatus::Closed => "Closed".normal(),
            }
        };

        println!(
            "{:<12} {:>12} {:>12} {:>12} {:>12} {:>10}",
            position.symbol,
            position.quantity,
            position.entry_price,
            position.high_water_mark,
            position.trailing_stop_price,
            status
        );

        match feed.get_price(&position.symbol).await {
            Ok(price) => println!(
                "{:<12} current {} | unrealized PnL {:.2}",
                "", price,
                position.unrealized_pnl(price)
            ),
            Err(_) => println!("{:<12} current price unavailable", ""),
        }
    }

    println!();
    Ok(())
}

async fn show_stats(config: &Config, limit: i64) -> Result<()> {
    let store = PositionStore::new(&config.database_path).await?;
    let stats = store.stats().await?;

    println!("\n{}", "=".repeat(70));
    println!("  TRADE STATISTICS");
    println!("{}\n", "=".repeat(70));

    println!("Overall Performance:");
    println!("  Completed Exits: {}", stats.total_trades);
    println!("  Winning Exits:   {}", stats.winning_trades);
    println!("  Losing Exits:    {}", stats.losing_trades);
    println!("  Win Rate:        {:.1}%", stats.win_rate());
    println!("  Total PnL:       {:.2}", stats.total_pnl);
    println!("  Open Positions:  {}", stats.open_positions);

    let trades = store.list_trades(limit).await?;
    if !trades.is_empty() {
        println!("\nRecent Exits:");
        for trade in &trades {
            let pnl = if trade.pnl >= Decimal::ZERO {
                format!("+{:.2}", trade.pnl).green()
            } else {
                format!("{:.2}", trade.pnl).red()
            };
            println!(
                "  {} {} @ {} -> {} (peak {}) {}",
                trade.symbol,
                trade.quantity,
                trade.entry_price,
                trade.exit_price,
                trade.peak_price,
                pnl
            );
        }
    }

    println!();
    Ok(())
}

async fn clear_flag(config: &Config, symbol: &str) -> Result<()> {
    let store = PositionStore::new(&config.database_path).await?;
    let symbol = symbol.to_uppercase();

    if store.clear_attention(&symbol).await? {
        println!("Cleared manual-intervention flag on {}; it will be re-adopted on the next supervisor tick.", symbol);
    } else {
        println!("{} is not flagged.", symbol);
    }

    Ok(())
}
