//! SQLite position store and trade log
//!
//! Sole durable owner of position records. Writes go through single
//! statements or transactions so a crash mid-write never leaves a
//! partially written record (WAL journal). A row that fails to decode is
//! quarantined in place and surfaced as `StoreError::Corruption`, never
//! silently dropped.

use crate::errors::StoreError;
use crate::types::{Position, PositionStatus, TradeRecord};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{error, info};

/// Aggregate statistics over the trade log.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: Decimal,
    pub open_positions: i64,
}

impl StoreStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64 * 100.0
    }
}

/// Database connection pool
pub struct PositionStore {
    pool: SqlitePool,
}

impl PositionStore {
    /// Open (or create) the store at the given path.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        Ok(store)
    }

    /// In-memory store. A single connection keeps every query on the same
    /// database instance.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                high_water_mark TEXT NOT NULL,
                trailing_stop_price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Active',
                opened_at TEXT NOT NULL,
                order_id TEXT,
                exit_failures INTEGER NOT NULL DEFAULT 0,
                needs_attention INTEGER NOT NULL DEFAULT 0,
                quarantined INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                peak_price TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                order_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
            .execute(&self.pool)
            .await?;

        info!("Position store initialized");
        Ok(())
    }

    /// Insert or replace a position record.
    pub async fn upsert(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO positions
                (symbol, entry_price, quantity, high_water_mark, trailing_stop_price,
                 status, opened_at, order_id, exit_failures, needs_attention, quarantined)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&position.symbol)
        .bind(position.entry_price.to_string())
        .bind(position.quantity.to_string())
        .bind(position.high_water_mark.to_string())
        .bind(position.trailing_stop_price.to_string())
        .bind(position.status.as_str())
        .bind(position.opened_at.to_rfc3339())
        .bind(&position.order_id)
        .bind(position.exit_failures)
        .bind(position.needs_attention)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one position. A row that fails to decode is quarantined and
    /// reported as corruption.
    pub async fn get(&self, symbol: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT * FROM positions WHERE symbol = ? AND quarantined = 0")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => match self.row_to_position(&r) {
                Ok(position) => Ok(Some(position)),
                Err(err) => {
                    self.quarantine(symbol).await?;
                    Err(err)
                }
            },
            None => Ok(None),
        }
    }

    /// All positions still under management (Active or Exiting), excluding
    /// quarantined rows. Undecodable rows are quarantined and skipped.
    pub async fn list_active(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status IN ('Active', 'Exiting') AND quarantined = 0 ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.row_to_position(row) {
                Ok(position) => positions.push(position),
                Err(err) => {
                    let symbol: String = row.get("symbol");
                    error!("Quarantining position record: {}", err);
                    self.quarantine(&symbol).await?;
                }
            }
        }

        Ok(positions)
    }

    /// Persist a new high-water mark and stop as one atomic step.
    ///
    /// The guard makes the mark monotonic: a stale writer with a lower
    /// mark is a no-op, so the persisted value can never regress, crash or
    /// not. Returns whether a row was updated.
    pub async fn update_trailing(
        &self,
        symbol: &str,
        high_water_mark: Decimal,
        stop_price: Decimal,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET high_water_mark = ?, trailing_stop_price = ?
            WHERE symbol = ? AND status = 'Active' AND quarantined = 0
              AND CAST(high_water_mark AS REAL) <= CAST(? AS REAL)
            "#,
        )
        .bind(high_water_mark.to_string())
        .bind(stop_price.to_string())
        .bind(symbol)
        .bind(high_water_mark.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update position status
    pub async fn set_status(&self, symbol: &str, status: PositionStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE positions SET status = ? WHERE symbol = ?")
            .bind(status.as_str())
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the consecutive-failure counter and return the new value.
    pub async fn record_exit_failure(&self, symbol: &str) -> Result<i64, StoreError> {
        sqlx::query("UPDATE positions SET exit_failures = exit_failures + 1 WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT exit_failures FROM positions WHERE symbol = ?")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }

    /// Flag a position for manual intervention. Flagged positions are not
    /// retried automatically.
    pub async fn flag_attention(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE positions SET needs_attention = 1 WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Operator action: clear the manual-intervention flag and reset the
    /// failure counter. Returns whether the symbol was flagged.
    pub async fn clear_attention(&self, symbol: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE positions SET needs_attention = 0, exit_failures = 0 WHERE symbol = ? AND needs_attention = 1",
        )
        .bind(symbol)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record an exit fill and settle the position in one transaction:
    /// full fill removes the record, partial fill keeps it Exiting with
    /// the remaining quantity and a reset failure counter.
    pub async fn finalize_exit(
        &self,
        trade: &TradeRecord,
        remaining: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trades
                (symbol, entry_price, exit_price, quantity, pnl, peak_price, opened_at, closed_at, order_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.symbol)
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.pnl.to_string())
        .bind(trade.peak_price.to_string())
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .bind(&trade.order_id)
        .execute(&mut *tx)
        .await?;

        match remaining {
            None => {
                sqlx::query("DELETE FROM positions WHERE symbol = ?")
                    .bind(&trade.symbol)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(quantity) => {
                sqlx::query(
                    "UPDATE positions SET quantity = ?, exit_failures = 0 WHERE symbol = ?",
                )
                .bind(quantity.to_string())
                .bind(&trade.symbol)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a position record.
    pub async fn remove(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM positions WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent completed exits, newest first.
    pub async fn list_trades(&self, limit: i64) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| self.row_to_trade(row)).collect()
    }

    /// Aggregate statistics over the trade log.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;

        let wins: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades WHERE CAST(pnl AS REAL) > 0")
            .fetch_one(&self.pool)
            .await?;

        let losses: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades WHERE CAST(pnl AS REAL) <= 0")
                .fetch_one(&self.pool)
                .await?;

        let open: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions WHERE status IN ('Active', 'Exiting') AND quarantined = 0",
        )
        .fetch_one(&self.pool)
        .await?;

        let pnl_rows: Vec<(String,)> = sqlx::query_as("SELECT pnl FROM trades")
            .fetch_all(&self.pool)
            .await?;
        let total_pnl = pnl_rows
            .iter()
            .filter_map(|(s,)| Decimal::from_str(s).ok())
            .sum();

        Ok(StoreStats {
            total_trades: total.0,
            winning_trades: wins.0,
            losing_trades: losses.0,
            total_pnl,
            open_positions: open.0,
        })
    }

    async fn quarantine(&self, symbol: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE positions SET quarantined = 1 WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_position(&self, row: &SqliteRow) -> Result<Position, StoreError> {
        let symbol: String = row.get("symbol");

        let corrupt = |detail: String| StoreError::Corruption {
            symbol: symbol.clone(),
            detail,
        };

        let decimal_field = |name: &str| -> Result<Decimal, StoreError> {
            let raw: String = row.get(name);
            Decimal::from_str(&raw).map_err(|e| corrupt(format!("{}: {}", name, e)))
        };

        let entry_price = decimal_field("entry_price")?;
        let quantity = decimal_field("quantity")?;
        let high_water_mark = decimal_field("high_water_mark")?;
        let trailing_stop_price = decimal_field("trailing_stop_price")?;

        let status_str: String = row.get("status");
        let status = PositionStatus::parse(&status_str)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", status_str)))?;

        let opened_at_str: String = row.get("opened_at");
        let opened_at = DateTime::parse_from_rfc3339(&opened_at_str)
            .map_err(|e| corrupt(format!("opened_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Position {
            symbol,
            entry_price,
            quantity,
            high_water_mark,
            trailing_stop_price,
            status,
            opened_at,
            order_id: row.get("order_id"),
            exit_failures: row.get("exit_failures"),
            needs_attention: row.get::<i64, _>("needs_attention") != 0,
        })
    }

    fn row_to_trade(&self, row: &SqliteRow) -> Result<TradeRecord, StoreError> {
        let symbol: String = row.get("symbol");

        let corrupt = |detail: String| StoreError::Corruption {
            symbol: symbol.clone(),
            detail,
        };

        let decimal_field = |name: &str| -> Result<Decimal, StoreError> {
            let raw: String = row.get(name);
            Decimal::from_str(&raw).map_err(|e| corrupt(format!("{}: {}", name, e)))
        };

        let date_field = |name: &str| -> Result<DateTime<Utc>, StoreError> {
            let raw: String = row.get(name);
            DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("{}: {}", name, e)))
        };

        Ok(TradeRecord {
            id: Some(row.get("id")),
            symbol: symbol.clone(),
            entry_price: decimal_field("entry_price")?,
            exit_price: decimal_field("exit_price")?,
            quantity: decimal_field("quantity")?,
            pnl: decimal_field("pnl")?,
            peak_price: decimal_field("peak_price")?,
            opened_at: date_field("opened_at")?,
            closed_at: date_field("closed_at")?,
            order_id: row.get("order_id"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            entry_price: dec!(100),
            quantity: dec!(1.5),
            high_water_mark: dec!(100),
            trailing_stop_price: dec!(98),
            status: PositionStatus::Active,
            opened_at: Utc::now(),
            order_id: Some("entry-1".to_string()),
            exit_failures: 0,
            needs_attention: false,
        }
    }

    fn sample_trade(symbol: &str) -> TradeRecord {
        TradeRecord {
            id: None,
            symbol: symbol.to_string(),
            entry_price: dec!(100),
            exit_price: dec!(107.8),
            quantity: dec!(1.5),
            pnl: dec!(11.7),
            peak_price: dec!(110),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            order_id: Some("exit-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = PositionStore::in_memory().await.unwrap();
        let position = sample_position("BTCUSDT");

        store.upsert(&position).await.unwrap();
        let loaded = store.get("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded, position);
    }

    #[tokio::test]
    async fn test_list_active_excludes_closed() {
        let store = PositionStore::in_memory().await.unwrap();
        let a = sample_position("AAAUSDT");
        let mut b = sample_position("BBBUSDT");
        b.status = PositionStatus::Exiting;
        let mut c = sample_position("CCCUSDT");
        c.status = PositionStatus::Closed;

        for p in [&a, &b, &c] {
            store.upsert(p).await.unwrap();
        }

        let active = store.list_active().await.unwrap();
        let symbols: Vec<_> = active.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAAUSDT", "BBBUSDT"]);
    }

    #[tokio::test]
    async fn test_update_trailing_is_monotonic() {
        let store = PositionStore::in_memory().await.unwrap();
        store.upsert(&sample_position("BTCUSDT")).await.unwrap();

        assert!(store
            .update_trailing("BTCUSDT", dec!(110), dec!(107.8))
            .await
            .unwrap());

        // Stale writer with a lower mark is a no-op
        assert!(!store
            .update_trailing("BTCUSDT", dec!(105), dec!(102.9))
            .await
            .unwrap());

        let loaded = store.get("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded.high_water_mark, dec!(110));
        assert_eq!(loaded.trailing_stop_price, dec!(107.8));
    }

    #[tokio::test]
    async fn test_update_trailing_skips_exiting_position() {
        let store = PositionStore::in_memory().await.unwrap();
        let mut position = sample_position("BTCUSDT");
        position.status = PositionStatus::Exiting;
        store.upsert(&position).await.unwrap();

        assert!(!store
            .update_trailing("BTCUSDT", dec!(120), dec!(117.6))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_exit_failures_and_flagging() {
        let store = PositionStore::in_memory().await.unwrap();
        store.upsert(&sample_position("BTCUSDT")).await.unwrap();

        assert_eq!(store.record_exit_failure("BTCUSDT").await.unwrap(), 1);
        assert_eq!(store.record_exit_failure("BTCUSDT").await.unwrap(), 2);

        store.flag_attention("BTCUSDT").await.unwrap();
        let loaded = store.get("BTCUSDT").await.unwrap().unwrap();
        assert!(loaded.needs_attention);
        assert_eq!(loaded.exit_failures, 2);

        assert!(store.clear_attention("BTCUSDT").await.unwrap());
        let loaded = store.get("BTCUSDT").await.unwrap().unwrap();
        assert!(!loaded.needs_attention);
        assert_eq!(loaded.exit_failures, 0);

        // Clearing an unflagged position reports false
        assert!(!store.clear_attention("BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_exit_full_fill_removes_position() {
        let store = PositionStore::in_memory().await.unwrap();
        store.upsert(&sample_position("BTCUSDT")).await.unwrap();

        store
            .finalize_exit(&sample_trade("BTCUSDT"), None)
            .await
            .unwrap();

        assert!(store.get("BTCUSDT").await.unwrap().is_none());
        let trades = store.list_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "BTCUSDT");
        assert_eq!(trades[0].pnl, dec!(11.7));
    }

    #[tokio::test]
    async fn test_finalize_exit_partial_fill_keeps_remainder() {
        let store = PositionStore::in_memory().await.unwrap();
        let mut position = sample_position("BTCUSDT");
        position.status = PositionStatus::Exiting;
        position.exit_failures = 2;
        store.upsert(&position).await.unwrap();

        let mut trade = sample_trade("BTCUSDT");
        trade.quantity = dec!(0.5);
        store.finalize_exit(&trade, Some(dec!(1.0))).await.unwrap();

        let loaded = store.get("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(loaded.quantity, dec!(1.0));
        assert_eq!(loaded.status, PositionStatus::Exiting);
        assert_eq!(loaded.exit_failures, 0);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_quarantined() {
        let store = PositionStore::in_memory().await.unwrap();
        store.upsert(&sample_position("BTCUSDT")).await.unwrap();
        store.upsert(&sample_position("ETHUSDT")).await.unwrap();

        sqlx::query("UPDATE positions SET entry_price = 'bogus' WHERE symbol = 'BTCUSDT'")
            .execute(&store.pool)
            .await
            .unwrap();

        // The bad row is skipped, the good one survives
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "ETHUSDT");

        // Quarantined, not dropped: the row is still in the table but
        // invisible to reads
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM positions WHERE symbol = 'BTCUSDT' AND quarantined = 1")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(count.0, 1);
        assert!(store.get("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = PositionStore::in_memory().await.unwrap();
        store.upsert(&sample_position("BTCUSDT")).await.unwrap();

        let mut win = sample_trade("AAAUSDT");
        win.pnl = dec!(5);
        let mut loss = sample_trade("BBBUSDT");
        loss.pnl = dec!(-2);
        store.finalize_exit(&win, None).await.unwrap();
        store.finalize_exit(&loss, None).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert_eq!(stats.total_pnl, dec!(3));
        assert_eq!(stats.open_positions, 1);
        assert!((stats.win_rate() - 50.0).abs() < f64::EPSILON);
    }
}
