//! Core types for the position lifecycle engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A held asset under trailing-stop management.
///
/// The Position Store is the sole durable owner of these records; any copy
/// held by a monitoring task is a working copy for a single cycle and must
/// be re-read after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Exchange trading pair identifier (e.g. "BTCUSDT")
    pub symbol: String,
    pub entry_price: Decimal,
    /// Amount currently held (shrinks on partial exit fills)
    pub quantity: Decimal,
    /// Highest price observed since entry. Never decreases while Active.
    pub high_water_mark: Decimal,
    /// Exit level derived from the high-water mark
    pub trailing_stop_price: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    /// Venue order id of the entry fill
    pub order_id: Option<String>,
    /// Consecutive failed exit attempts since the last success
    pub exit_failures: i64,
    /// Escalated for manual intervention; excluded from automatic retries
    pub needs_attention: bool,
}

impl Position {
    /// Unrealized PnL at the given price.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }
}

/// Lifecycle state of a position.
///
/// Active -> Exiting on a trailing-stop trigger; Exiting -> Closed only
/// once the exit order is confirmed filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Exiting,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "Active",
            PositionStatus::Exiting => "Exiting",
            PositionStatus::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(PositionStatus::Active),
            "Exiting" => Some(PositionStatus::Exiting),
            "Closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Confirmed result of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    /// Quantity-weighted average price across fills
    pub fill_price: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
}

/// Fill state reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
}

/// A completed (full or partial) exit, appended to the trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    /// High-water mark at the time the stop fired
    pub peak_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Venue order id of the exit fill
    pub order_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            entry_price: dec!(100),
            quantity: dec!(2),
            high_water_mark: dec!(100),
            trailing_stop_price: dec!(98),
            status: PositionStatus::Active,
            opened_at: Utc::now(),
            order_id: None,
            exit_failures: 0,
            needs_attention: false,
        }
    }

    #[test]
    fn test_unrealized_pnl() {
        let pos = sample_position();
        assert_eq!(pos.unrealized_pnl(dec!(110)), dec!(20));
        assert_eq!(pos.unrealized_pnl(dec!(95)), dec!(-10));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PositionStatus::Active,
            PositionStatus::Exiting,
            PositionStatus::Closed,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PositionStatus::parse("Open"), None);
    }
}
