//! Trailing-stop decision engine
//!
//! Pure per-observation logic: no I/O, no clock, no retained state. The
//! caller persists `UpdateHighWater` results through the Position Store
//! before the next observation.

use crate::types::{Position, PositionStatus};
use rust_decimal::Decimal;

/// Decision for one price observation.
#[derive(Debug, Clone, PartialEq)]
pub enum StopAction {
    /// Price inside the band; nothing to do
    Hold,
    /// New peak; persist both values atomically before the next observation
    UpdateHighWater {
        high_water_mark: Decimal,
        stop_price: Decimal,
    },
    /// Price at or below the stop; begin the exit
    TriggerExit,
}

/// Exit level for a given peak: `mark * (1 - trailing_percent / 100)`.
pub fn stop_price(high_water_mark: Decimal, trailing_percent: Decimal) -> Decimal {
    high_water_mark * (Decimal::ONE - trailing_percent / Decimal::ONE_HUNDRED)
}

/// Evaluate one observation against an Active position.
///
/// A new high is always preferred over an exit check: a price above the
/// mark is necessarily above the stop. Equality with the stop triggers the
/// exit (the stop is inclusive). Non-Active positions always hold; their
/// lifecycle is owned by the manager.
pub fn evaluate(position: &Position, price: Decimal, trailing_percent: Decimal) -> StopAction {
    if position.status != PositionStatus::Active {
        return StopAction::Hold;
    }

    if price > position.high_water_mark {
        StopAction::UpdateHighWater {
            high_water_mark: price,
            stop_price: stop_price(price, trailing_percent),
        }
    } else if price <= position.trailing_stop_price {
        StopAction::TriggerExit
    } else {
        StopAction::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(entry: Decimal, mark: Decimal, stop: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            entry_price: entry,
            quantity: dec!(1),
            high_water_mark: mark,
            trailing_stop_price: stop,
            status: PositionStatus::Active,
            opened_at: Utc::now(),
            order_id: None,
            exit_failures: 0,
            needs_attention: false,
        }
    }

    #[test]
    fn test_stop_price_formula() {
        assert_eq!(stop_price(dec!(100), dec!(2)), dec!(98.00));
        assert_eq!(stop_price(dec!(110), dec!(2)), dec!(107.80));
        assert_eq!(stop_price(dec!(50), dec!(10)), dec!(45.00));
    }

    #[test]
    fn test_new_high_updates_mark_and_stop() {
        let pos = position(dec!(100), dec!(100), dec!(98));
        let action = evaluate(&pos, dec!(110), dec!(2));
        assert_eq!(
            action,
            StopAction::UpdateHighWater {
                high_water_mark: dec!(110),
                stop_price: dec!(107.80),
            }
        );
    }

    #[test]
    fn test_price_in_band_holds() {
        let pos = position(dec!(100), dec!(110), dec!(107.80));
        assert_eq!(evaluate(&pos, dec!(109), dec!(2)), StopAction::Hold);
        assert_eq!(evaluate(&pos, dec!(107.81), dec!(2)), StopAction::Hold);
    }

    #[test]
    fn test_stop_is_inclusive() {
        let pos = position(dec!(100), dec!(110), dec!(107.80));
        assert_eq!(evaluate(&pos, dec!(107.80), dec!(2)), StopAction::TriggerExit);
        assert_eq!(evaluate(&pos, dec!(107.79), dec!(2)), StopAction::TriggerExit);
    }

    /// entry 100 at 2% -> stop 98; rise to 110 -> stop 107.8; drop to
    /// 107.8 -> exit.
    #[test]
    fn test_capture_scenario() {
        let mut pos = position(dec!(100), dec!(100), dec!(98));

        match evaluate(&pos, dec!(110), dec!(2)) {
            StopAction::UpdateHighWater {
                high_water_mark,
                stop_price,
            } => {
                pos.high_water_mark = high_water_mark;
                pos.trailing_stop_price = stop_price;
            }
            other => panic!("expected high-water update, got {:?}", other),
        }
        assert_eq!(pos.trailing_stop_price, dec!(107.80));

        assert_eq!(evaluate(&pos, dec!(107.8), dec!(2)), StopAction::TriggerExit);
    }

    /// The exit fires below entry too; capital protection does not wait
    /// for the position to be in profit.
    #[test]
    fn test_exit_below_entry() {
        let pos = position(dec!(100), dec!(100), dec!(98));
        assert_eq!(evaluate(&pos, dec!(90), dec!(2)), StopAction::TriggerExit);
    }

    /// For any observation sequence the mark never decreases and the stop
    /// always tracks `mark * (1 - pct/100)`.
    #[test]
    fn test_mark_monotonic_over_sequence() {
        let mut pos = position(dec!(100), dec!(100), dec!(98));
        let prices = [
            dec!(101),
            dec!(99),
            dec!(105),
            dec!(104.9),
            dec!(103),
            dec!(105.01),
        ];

        for price in prices {
            let prev_mark = pos.high_water_mark;
            match evaluate(&pos, price, dec!(2)) {
                StopAction::UpdateHighWater {
                    high_water_mark,
                    stop_price: stop,
                } => {
                    assert!(high_water_mark > prev_mark);
                    assert_eq!(stop, stop_price(high_water_mark, dec!(2)));
                    pos.high_water_mark = high_water_mark;
                    pos.trailing_stop_price = stop;
                }
                StopAction::TriggerExit => panic!("no price in sequence reaches the stop"),
                StopAction::Hold => assert_eq!(pos.high_water_mark, prev_mark),
            }
            assert!(pos.trailing_stop_price <= pos.high_water_mark);
        }
        assert_eq!(pos.high_water_mark, dec!(105.01));
    }

    #[test]
    fn test_non_active_position_holds() {
        let mut pos = position(dec!(100), dec!(110), dec!(107.80));
        pos.status = PositionStatus::Exiting;
        assert_eq!(evaluate(&pos, dec!(50), dec!(2)), StopAction::Hold);
    }
}
