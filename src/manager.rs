//! Position manager
//!
//! Runs one monitoring task per position under management. Each cycle
//! re-reads the position from the store, fetches a price, asks the engine
//! for a decision, and applies it back through the store. A failure on one
//! symbol never takes down monitoring of the others.

use crate::config::Config;
use crate::db::PositionStore;
use crate::engine::{self, StopAction};
use crate::errors::StoreError;
use crate::feed::MarketDataFeed;
use crate::gateway::OrderGateway;
use crate::retry::{with_retry, RetryConfig};
use crate::types::{OrderStatus, Position, PositionStatus, Side, TradeRecord};
use crate::webhook::OpsWebhook;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runtime knobs for the manager and its monitoring tasks.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub trailing_percent: Decimal,
    pub poll_interval: Duration,
    pub max_exit_failures: u32,
    pub retry: RetryConfig,
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            trailing_percent: config.trailing_percent,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            max_exit_failures: config.max_exit_failures,
            retry: config.retry.clone(),
        }
    }
}

/// Shared dependencies handed to each monitoring task.
#[derive(Clone)]
struct MonitorCtx {
    store: Arc<PositionStore>,
    feed: Arc<dyn MarketDataFeed>,
    gateway: Arc<dyn OrderGateway>,
    alerts: Option<Arc<OpsWebhook>>,
    config: ManagerConfig,
}

/// What a monitoring task does after a cycle.
#[derive(Debug, PartialEq)]
enum CycleOutcome {
    /// Keep monitoring on the next tick
    Continue,
    /// The position left management (closed, escalated, or gone)
    Finished,
}

/// Orchestrates the trailing-stop lifecycle across all open positions.
pub struct PositionManager {
    store: Arc<PositionStore>,
    feed: Arc<dyn MarketDataFeed>,
    gateway: Arc<dyn OrderGateway>,
    alerts: Option<Arc<OpsWebhook>>,
    config: ManagerConfig,
}

impl PositionManager {
    pub fn new(
        store: Arc<PositionStore>,
        feed: Arc<dyn MarketDataFeed>,
        gateway: Arc<dyn OrderGateway>,
        alerts: Option<Arc<OpsWebhook>>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            feed,
            gateway,
            alerts,
            config,
        }
    }

    fn ctx(&self) -> MonitorCtx {
        MonitorCtx {
            store: self.store.clone(),
            feed: self.feed.clone(),
            gateway: self.gateway.clone(),
            alerts: self.alerts.clone(),
            config: self.config.clone(),
        }
    }

    /// Place an entry order and create the position from its confirmed
    /// fill. The high-water mark starts at the fill price.
    pub async fn open_position(&self, symbol: &str, quote_amount: Decimal) -> Result<Position> {
        if quote_amount <= Decimal::ZERO {
            bail!("Quote amount must be positive, got {}", quote_amount);
        }
        if self.store.get(symbol).await?.is_some() {
            bail!("Already holding {}", symbol);
        }

        let price = self
            .feed
            .get_price(symbol)
            .await
            .context("Failed to fetch entry price")?;

        let quantity = (quote_amount / price).round_dp(8);
        if quantity.is_zero() {
            bail!("Quote amount {} buys zero {} at {}", quote_amount, symbol, price);
        }

        let client_order_id = Uuid::new_v4().to_string();
        let receipt = with_retry(&self.config.retry, "market buy", || {
            self.gateway
                .place_market_order(symbol, Side::Buy, quantity, &client_order_id)
        })
        .await
        .context("Entry order failed")?;

        let entry_price = receipt.fill_price;
        let position = Position {
            symbol: symbol.to_string(),
            entry_price,
            quantity: receipt.filled_quantity,
            high_water_mark: entry_price,
            trailing_stop_price: engine::stop_price(entry_price, self.config.trailing_percent),
            status: PositionStatus::Active,
            opened_at: Utc::now(),
            order_id: Some(receipt.order_id.clone()),
            exit_failures: 0,
            needs_attention: false,
        };

        self.store.upsert(&position).await?;
        info!(
            "Opened {} {} at {} (stop {})",
            position.quantity, symbol, entry_price, position.trailing_stop_price
        );

        Ok(position)
    }

    /// Run until the shutdown signal flips.
    ///
    /// A supervisor tick reconciles the store against running tasks,
    /// adopting positions created while running and re-adopting
    /// Active/Exiting positions after a restart. On shutdown no new
    /// cycles start; in-flight exits run to completion and remaining
    /// positions stay in the store for the next startup.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("Position manager started");

        let mut tasks: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut tick = tokio::time::interval(self.config.poll_interval);
        let mut shutdown_rx = shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {
                    tasks.retain(|_, handle| !handle.is_finished());

                    match self.store.list_active().await {
                        Ok(positions) => {
                            for position in positions {
                                if position.needs_attention {
                                    debug!(
                                        "{} is flagged for manual intervention, not monitoring",
                                        position.symbol
                                    );
                                    continue;
                                }
                                if !tasks.contains_key(&position.symbol) {
                                    info!("Adopting {} ({})", position.symbol, position.status);
                                    let ctx = self.ctx();
                                    let rx = shutdown.clone();
                                    let symbol = position.symbol.clone();
                                    tasks.insert(
                                        position.symbol.clone(),
                                        tokio::spawn(monitor_position(symbol, ctx, rx)),
                                    );
                                }
                            }
                        }
                        Err(e) => error!("Failed to list positions: {}", e),
                    }
                }
            }
        }

        info!("Shutdown: waiting for {} in-flight monitors", tasks.len());
        join_all(tasks.drain().map(|(_, handle)| handle)).await;
        info!("Position manager stopped");
    }
}

/// Per-position monitoring loop. The shutdown check sits before each
/// cycle, so an in-flight exit always completes.
async fn monitor_position(symbol: String, ctx: MonitorCtx, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("{}: shutdown, position stays in the store", symbol);
                return;
            }
            _ = interval.tick() => {}
        }

        match run_cycle(&symbol, &ctx).await {
            CycleOutcome::Continue => {}
            CycleOutcome::Finished => return,
        }
    }
}

/// One monitoring cycle: re-read the working copy, then act on its state.
async fn run_cycle(symbol: &str, ctx: &MonitorCtx) -> CycleOutcome {
    let position = match ctx.store.get(symbol).await {
        Ok(Some(position)) => position,
        Ok(None) => {
            debug!("{}: no longer in store, monitor ends", symbol);
            return CycleOutcome::Finished;
        }
        Err(err @ StoreError::Corruption { .. }) => {
            error!("{}: {}", symbol, err);
            if let Some(alerts) = &ctx.alerts {
                alerts.send_corruption(symbol, &err.to_string()).await;
            }
            return CycleOutcome::Finished;
        }
        Err(e) => {
            warn!("{}: store read failed, skipping cycle: {}", symbol, e);
            return CycleOutcome::Continue;
        }
    };

    if position.needs_attention {
        return CycleOutcome::Finished;
    }

    match position.status {
        PositionStatus::Active => run_active_cycle(position, ctx).await,
        PositionStatus::Exiting => attempt_exit(&position, ctx).await,
        PositionStatus::Closed => CycleOutcome::Finished,
    }
}

async fn run_active_cycle(position: Position, ctx: &MonitorCtx) -> CycleOutcome {
    let price = match ctx.feed.get_price(&position.symbol).await {
        Ok(price) => price,
        Err(e) => {
            warn!(
                "{}: price fetch failed, skipping cycle: {}",
                position.symbol, e
            );
            return CycleOutcome::Continue;
        }
    };

    match engine::evaluate(&position, price, ctx.config.trailing_percent) {
        StopAction::Hold => CycleOutcome::Continue,
        StopAction::UpdateHighWater {
            high_water_mark,
            stop_price,
        } => {
            match ctx
                .store
                .update_trailing(&position.symbol, high_water_mark, stop_price)
                .await
            {
                Ok(true) => debug!(
                    "{}: new high {} raises stop to {}",
                    position.symbol, high_water_mark, stop_price
                ),
                Ok(false) => debug!("{}: stale high-water update skipped", position.symbol),
                Err(e) => warn!(
                    "{}: failed to persist high-water mark: {}",
                    position.symbol, e
                ),
            }
            CycleOutcome::Continue
        }
        StopAction::TriggerExit => {
            info!(
                "{}: price {} at or below stop {}, exiting",
                position.symbol, price, position.trailing_stop_price
            );
            if let Err(e) = ctx
                .store
                .set_status(&position.symbol, PositionStatus::Exiting)
                .await
            {
                warn!("{}: failed to persist Exiting status: {}", position.symbol, e);
                return CycleOutcome::Continue;
            }

            let mut exiting = position;
            exiting.status = PositionStatus::Exiting;
            attempt_exit(&exiting, ctx).await
        }
    }
}

/// One exit attempt: a market sell with bounded retry. Success settles
/// the fill through the store; failure bumps the counter and escalates
/// past the threshold.
async fn attempt_exit(position: &Position, ctx: &MonitorCtx) -> CycleOutcome {
    // One id per attempt chain: retries inside with_retry resubmit the
    // same id and cannot double-execute at the venue.
    let client_order_id = Uuid::new_v4().to_string();
    let result = with_retry(&ctx.config.retry, "market sell", || {
        ctx.gateway.place_market_order(
            &position.symbol,
            Side::Sell,
            position.quantity,
            &client_order_id,
        )
    })
    .await;

    match result {
        Ok(receipt) => {
            let trade = TradeRecord {
                id: None,
                symbol: position.symbol.clone(),
                entry_price: position.entry_price,
                exit_price: receipt.fill_price,
                quantity: receipt.filled_quantity,
                pnl: (receipt.fill_price - position.entry_price) * receipt.filled_quantity,
                peak_price: position.high_water_mark,
                opened_at: position.opened_at,
                closed_at: Utc::now(),
                order_id: Some(receipt.order_id.clone()),
            };

            let remaining = position.quantity - receipt.filled_quantity;
            let fully_filled =
                receipt.status == OrderStatus::Filled || remaining <= Decimal::ZERO;

            let settle = if fully_filled { None } else { Some(remaining) };
            if let Err(e) = ctx.store.finalize_exit(&trade, settle).await {
                // The fill happened but the store write failed. The next
                // cycle re-sells, the venue rejects the oversell, and the
                // position escalates to the operator instead of silently
                // double-selling.
                error!("{}: exit fill not persisted: {}", position.symbol, e);
                return CycleOutcome::Continue;
            }

            if let Some(alerts) = &ctx.alerts {
                alerts.send_exit(&trade).await;
            }

            if fully_filled {
                info!(
                    "{}: exit filled at {} (PnL {:.2})",
                    position.symbol, receipt.fill_price, trade.pnl
                );
                CycleOutcome::Finished
            } else {
                info!(
                    "{}: partial exit fill of {}, {} remaining",
                    position.symbol, receipt.filled_quantity, remaining
                );
                CycleOutcome::Continue
            }
        }
        Err(err) => {
            warn!("{}: exit attempt failed: {}", position.symbol, err);

            let failures = match ctx.store.record_exit_failure(&position.symbol).await {
                Ok(n) => n,
                Err(e) => {
                    error!("{}: failed to record exit failure: {}", position.symbol, e);
                    return CycleOutcome::Continue;
                }
            };

            if failures >= ctx.config.max_exit_failures as i64 {
                error!(
                    "{}: {} consecutive exit failures, escalating for manual intervention",
                    position.symbol, failures
                );
                if let Err(e) = ctx.store.flag_attention(&position.symbol).await {
                    error!("{}: failed to flag position: {}", position.symbol, e);
                    return CycleOutcome::Continue;
                }
                if let Some(alerts) = &ctx.alerts {
                    let mut flagged = position.clone();
                    flagged.exit_failures = failures;
                    flagged.needs_attention = true;
                    alerts
                        .send_escalation(
                            &flagged,
                            &format!("Exit failed {} times, last error: {}", failures, err),
                        )
                        .await;
                }
                CycleOutcome::Finished
            } else {
                CycleOutcome::Continue
            }
        }
    }
}
