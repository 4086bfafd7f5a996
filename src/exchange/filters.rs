use crate::exchange::error::ExchangeError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Per-symbol trading rules from exchangeInfo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Round a price to the nearest tick
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        let ticks = (price / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        (ticks * self.tick_size).normalize()
    }

    /// Truncate a quantity down to the step grid
    pub fn floor_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return qty;
        }
        let steps = (qty / self.step_size).floor();
        (steps * self.step_size).normalize()
    }

    fn on_step(&self, qty: Decimal) -> bool {
        self.step_size.is_zero() || (qty % self.step_size).is_zero()
    }

    /// Check an order against the symbol limits
    pub fn validate(&self, qty: Decimal, price: Decimal) -> Result<(), ExchangeError> {
        if qty < self.min_qty {
            return Err(ExchangeError::Rejected(format!(
                "{} quantity {} below minimum {}",
                self.symbol, qty, self.min_qty
            )));
        }
        if !self.max_qty.is_zero() && qty > self.max_qty {
            return Err(ExchangeError::Rejected(format!(
                "{} quantity {} above maximum {}",
                self.symbol, qty, self.max_qty
            )));
        }
        if !self.on_step(qty) {
            return Err(ExchangeError::Rejected(format!(
                "{} quantity {} not a multiple of step {}",
                self.symbol, qty, self.step_size
            )));
        }
        let notional = qty * price;
        if notional < self.min_notional {
            return Err(ExchangeError::Rejected(format!(
                "{} notional {} below minimum {}",
                self.symbol, notional, self.min_notional
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eth() -> SymbolFilters {
        SymbolFilters {
            symbol: "ETHUSDT".into(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(10000),
            min_notional: dec!(20),
        }
    }

    #[test]
    fn test_price_rounding() {
        let f = eth();
        assert_eq!(f.round_price(dec!(3012.3456)), dec!(3012.35));
        assert_eq!(f.round_price(dec!(3012.344)), dec!(3012.34));
    }

    #[test]
    fn test_qty_floor() {
        let f = eth();
        assert_eq!(f.floor_qty(dec!(0.12399)), dec!(0.123));
        assert_eq!(f.floor_qty(dec!(0.0009)), dec!(0));
    }

    #[test]
    fn test_validate() {
        let f = eth();
        assert!(f.validate(dec!(0.01), dec!(3000)).is_ok());
        // 0.005 * 3000 = 15 < 20
        assert!(f.validate(dec!(0.005), dec!(3000)).is_err());
        assert!(f.validate(dec!(0.0005), dec!(3000)).is_err());
        assert!(f.validate(dec!(0.0105), dec!(3000)).is_err());
        assert!(f.validate(dec!(20000), dec!(3000)).is_err());
    }
}
