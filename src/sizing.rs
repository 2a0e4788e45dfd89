// =============================================================================
// Position Sizer: order quantity from capital, leverage and risk
// =============================================================================
//
// Two strategies:
//
//   flat capital   qty = capital_per_trade × leverage / entry
//   risk based     qty = (capital × risk% / stop_loss%) × leverage / entry
//
// All arithmetic is exact decimal; the result is rounded DOWN to the
// exchange's quantity step so the order never exceeds the computed notional.
// =============================================================================

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("entry price {0} is not a positive finite number")]
    InvalidPrice(f64),

    #[error("computed quantity {raw} rounds to zero at step {step}")]
    ZeroQuantity { raw: Decimal, step: Decimal },

    #[error("decimal overflow while sizing")]
    Overflow,
}

/// How much notional to commit per trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingStrategy {
    /// Fixed margin per trade, scaled by leverage.
    FlatCapital { capital_per_trade: Decimal },
    /// Lose at most `risk_percent` of `capital` when the fixed stop is hit.
    RiskBased {
        capital: Decimal,
        risk_percent: Decimal,
    },
}

impl Default for SizingStrategy {
    fn default() -> Self {
        Self::FlatCapital {
            capital_per_trade: Decimal::TEN,
        }
    }
}

// =============================================================================
// Rounding helpers (shared with the order planner)
// =============================================================================

/// Direction to snap a value onto an increment grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// Snap `value` onto a multiple of `increment`. A non-positive increment
/// leaves the value unchanged.
pub fn round_to_increment(value: Decimal, increment: Decimal, rounding: Rounding) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let Some(units) = value.checked_div(increment) else {
        return value;
    };
    let units = match rounding {
        Rounding::Down => units.floor(),
        Rounding::Up => units.ceil(),
    };
    units.checked_mul(increment).map_or(value, |v| v.normalize())
}

/// Quantity rounding: always down.
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    round_to_increment(value, step, Rounding::Down)
}

/// Convert a market price to a decimal through its shortest decimal
/// representation, so 27345.37 stays 27345.37 instead of its binary
/// expansion.
pub fn price_to_decimal(price: f64) -> Option<Decimal> {
    if !price.is_finite() {
        return None;
    }
    Decimal::from_str(&price.to_string()).ok()
}

// =============================================================================
// Sizer
// =============================================================================

#[derive(Debug, Clone)]
pub struct PositionSizer {
    strategy: SizingStrategy,
    leverage: u32,
    stop_loss_percent: Decimal,
    step_size: Decimal,
}

impl PositionSizer {
    pub fn new(
        strategy: SizingStrategy,
        leverage: u32,
        stop_loss_percent: Decimal,
        step_size: Decimal,
    ) -> Self {
        Self {
            strategy,
            leverage,
            stop_loss_percent,
            step_size,
        }
    }

    /// Quantity for an entry at `entry_price`, rounded down to the step size.
    pub fn quantity(&self, entry_price: f64) -> Result<Decimal, SizingError> {
        let price = price_to_decimal(entry_price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or(SizingError::InvalidPrice(entry_price))?;

        let margin = match &self.strategy {
            SizingStrategy::FlatCapital { capital_per_trade } => *capital_per_trade,
            SizingStrategy::RiskBased {
                capital,
                risk_percent,
            } => capital
                .checked_mul(*risk_percent)
                .and_then(|risk| risk.checked_div(self.stop_loss_percent))
                .ok_or(SizingError::Overflow)?,
        };

        let raw = margin
            .checked_mul(Decimal::from(self.leverage))
            .and_then(|notional| notional.checked_div(price))
            .ok_or(SizingError::Overflow)?;

        let qty = round_down_to_step(raw, self.step_size);
        if qty <= Decimal::ZERO {
            return Err(SizingError::ZeroQuantity {
                raw,
                step: self.step_size,
            });
        }
        Ok(qty)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn step_round_down() {
        assert_eq!(round_down_to_step(dec!(12.3456), dec!(0.001)), dec!(12.345));
        assert_eq!(round_down_to_step(dec!(12.3459), dec!(0.001)), dec!(12.345));
        assert_eq!(round_down_to_step(dec!(5), dec!(0.001)), dec!(5));
        assert_eq!(round_down_to_step(dec!(0.0009), dec!(0.001)), dec!(0));
    }

    #[test]
    fn increment_rounding_both_ways() {
        assert_eq!(round_to_increment(dec!(27345.37), dec!(0.1), Rounding::Down), dec!(27345.3));
        assert_eq!(round_to_increment(dec!(27345.37), dec!(0.1), Rounding::Up), dec!(27345.4));
        assert_eq!(round_to_increment(dec!(27345.3), dec!(0.1), Rounding::Up), dec!(27345.3));
        assert_eq!(round_to_increment(dec!(4500.10), dec!(0.25), Rounding::Up), dec!(4500.25));
    }

    #[test]
    fn zero_increment_is_identity() {
        assert_eq!(round_to_increment(dec!(1.2345), Decimal::ZERO, Rounding::Down), dec!(1.2345));
    }

    #[test]
    fn price_conversion_keeps_short_representation() {
        assert_eq!(price_to_decimal(27345.37), Some(dec!(27345.37)));
        assert_eq!(price_to_decimal(0.1), Some(dec!(0.1)));
        assert_eq!(price_to_decimal(f64::NAN), None);
        assert_eq!(price_to_decimal(f64::INFINITY), None);
    }

    #[test]
    fn flat_capital_matches_formula() {
        // 10 USDT × 20x / 27000 = 0.0074074… → 0.007
        let sizer = PositionSizer::new(SizingStrategy::default(), 20, dec!(0.02), dec!(0.001));
        assert_eq!(sizer.quantity(27000.0).unwrap(), dec!(0.007));
    }

    #[test]
    fn risk_based_matches_formula() {
        // (1000 × 0.01 / 0.02) × 10 / 2500 = 2.0
        let sizer = PositionSizer::new(
            SizingStrategy::RiskBased {
                capital: dec!(1000),
                risk_percent: dec!(0.01),
            },
            10,
            dec!(0.02),
            dec!(0.001),
        );
        assert_eq!(sizer.quantity(2500.0).unwrap(), dec!(2));

        // Tighter stop means a bigger position for the same risk.
        let tight = PositionSizer::new(
            SizingStrategy::RiskBased {
                capital: dec!(1000),
                risk_percent: dec!(0.01),
            },
            10,
            dec!(0.01),
            dec!(0.001),
        );
        assert_eq!(tight.quantity(2500.0).unwrap(), dec!(4));
    }

    #[test]
    fn non_positive_price_is_degenerate() {
        let sizer = PositionSizer::new(SizingStrategy::default(), 20, dec!(0.02), dec!(0.001));
        assert_eq!(sizer.quantity(0.0), Err(SizingError::InvalidPrice(0.0)));
        assert!(matches!(sizer.quantity(-5.0), Err(SizingError::InvalidPrice(_))));
        assert!(matches!(sizer.quantity(f64::NAN), Err(SizingError::InvalidPrice(_))));
    }

    #[test]
    fn dust_quantity_is_degenerate() {
        // 10 × 1 / 100000 = 0.0001 < step 0.001
        let sizer = PositionSizer::new(SizingStrategy::default(), 1, dec!(0.02), dec!(0.001));
        assert!(matches!(
            sizer.quantity(100_000.0),
            Err(SizingError::ZeroQuantity { .. })
        ));
    }

    #[test]
    fn strategy_deserializes_tagged() {
        let s: SizingStrategy =
            serde_json::from_str(r#"{"mode":"risk_based","capital":"500","risk_percent":"0.02"}"#)
                .unwrap();
        assert_eq!(
            s,
            SizingStrategy::RiskBased {
                capital: dec!(500),
                risk_percent: dec!(0.02)
            }
        );
    }
}
