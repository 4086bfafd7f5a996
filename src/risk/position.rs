use crate::data::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Open position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Buy = long, Sell = short
    pub side: Side,
    /// Absolute size in base units
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub liquidation_price: Option<Decimal>,
    /// First time this position was observed locally
    pub opened_at: SystemTime,
}

impl Position {
    /// Build from a signed position amount (negative = short)
    pub fn from_signed(symbol: &str, amount: Decimal, entry_price: Decimal, mark_price: Decimal) -> Self {
        let side = if amount < Decimal::ZERO { Side::Sell } else { Side::Buy };
        let quantity = amount.abs();

        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            mark_price,
            unrealized_pnl: (mark_price - entry_price) * amount,
            leverage: 1,
            liquidation_price: None,
            opened_at: SystemTime::now(),
        }
    }

    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.side.sign()
    }

    /// Notional at entry
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// Unrealized PnL at an arbitrary price
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.signed_quantity()
    }

    /// Price move from entry in basis points, positive when in our favour
    pub fn move_bps(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::from(10_000) * self.side.sign()
    }

    pub fn take_profit_hit(&self, price: Decimal, take_profit_bps: Decimal) -> bool {
        self.move_bps(price) >= take_profit_bps
    }

    pub fn stop_loss_hit(&self, price: Decimal, stop_loss_bps: Decimal) -> bool {
        self.move_bps(price) <= -stop_loss_bps
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.opened_at)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, max_hold_time_ms: u64) -> bool {
        self.age().as_millis() as u64 > max_hold_time_ms
    }

    /// Distance from mark to liquidation as a percentage of mark
    pub fn liquidation_distance_pct(&self) -> Option<Decimal> {
        let liq = self.liquidation_price?;
        if self.mark_price.is_zero() {
            return None;
        }
        Some(((self.mark_price - liq) / self.mark_price * Decimal::from(100)).abs())
    }

    /// Side of the order that closes this position
    pub fn close_side(&self) -> Side {
        self.side.opposite()
    }
}

/// Round trip that has been closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub fees: Decimal,
    pub realized_pnl: Decimal,
    pub closed_at: SystemTime,
}

impl ClosedTrade {
    /// Close `position` at `exit_price`, charging `fees`
    pub fn from_exit(position: &Position, exit_price: Decimal, quantity: Decimal, fees: Decimal) -> Self {
        let gross = (exit_price - position.entry_price) * quantity * position.side.sign();
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity,
            fees,
            realized_pnl: gross - fees,
            closed_at: SystemTime::now(),
        }
    }
}

/// Local view of open positions plus the history of closed trades
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
    closed: Vec<ClosedTrade>,
    total_realized_pnl: Decimal,
    total_fees: Decimal,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the open set with a venue snapshot
    ///
    /// First-seen times survive for symbols that stay open on the same side,
    /// so max-hold exits measure from when the position first appeared.
    ///
    /// Returns what shrank since the last sync: the position as it was held
    /// and the quantity that went away. A flip or a vanished symbol counts
    /// as the whole old position closing.
    pub fn sync(&mut self, snapshot: Vec<Position>) -> Vec<(Position, Decimal)> {
        let mut previous = std::mem::take(&mut self.positions);
        let mut reductions = Vec::new();

        for mut position in snapshot {
            if let Some(existing) = previous.remove(&position.symbol) {
                if existing.side != position.side {
                    let quantity = existing.quantity;
                    reductions.push((existing, quantity));
                } else {
                    position.opened_at = existing.opened_at;
                    if position.quantity < existing.quantity {
                        let quantity = existing.quantity - position.quantity;
                        reductions.push((existing, quantity));
                    }
                }
            }
            self.positions.insert(position.symbol.clone(), position);
        }

        for (_, existing) in previous {
            let quantity = existing.quantity;
            reductions.push((existing, quantity));
        }
        reductions.sort_by(|a, b| a.0.symbol.cmp(&b.0.symbol));
        reductions
    }

    /// Shrink a held position by an exit the engine booked itself
    pub fn reduce(&mut self, symbol: &str, quantity: Decimal) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        position.quantity -= quantity.min(position.quantity);
        if position.quantity.is_zero() {
            self.positions.remove(symbol);
        }
    }

    /// Record fees paid on an opening fill
    pub fn record_fee(&mut self, fee: Decimal) {
        self.total_fees += fee;
    }

    pub fn record_close(&mut self, trade: ClosedTrade) {
        self.total_realized_pnl += trade.realized_pnl;
        self.total_fees += trade.fees;
        self.closed.push(trade);
    }

    /// Open positions sorted by symbol
    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Sum of entry notionals
    pub fn total_exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    /// Unrealized PnL at the given marks; symbols without a mark are skipped
    pub fn total_unrealized_pnl(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|price| p.pnl_at(*price)))
            .sum()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.total_realized_pnl
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_fees
    }

    pub fn win_rate(&self) -> f64 {
        if self.closed.is_empty() {
            return 0.0;
        }
        let wins = self
            .closed
            .iter()
            .filter(|t| t.realized_pnl > Decimal::ZERO)
            .count();
        wins as f64 / self.closed.len() as f64
    }

    pub fn average_trade_pnl(&self) -> Decimal {
        if self.closed.is_empty() {
            return Decimal::ZERO;
        }
        self.total_realized_pnl / Decimal::from(self.closed.len())
    }
}
