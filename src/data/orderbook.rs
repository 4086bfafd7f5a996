use crate::data::types::Side;
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Two-sided order book shared between the poller and the trading loop
///
/// Levels live in concurrent maps so the poller can write while signal
/// code reads through an `Arc<OrderBook>`.
pub struct OrderBook {
    symbol: String,
    bids: DashMap<Decimal, Decimal>,
    asks: DashMap<Decimal, Decimal>,
    last_update_id: AtomicU64,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: DashMap::new(),
            asks: DashMap::new(),
            last_update_id: AtomicU64::new(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id.load(Ordering::Acquire)
    }

    fn side_map(&self, side: Side) -> &DashMap<Decimal, Decimal> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Set one level. Zero quantity removes it.
    pub fn update_level(&self, side: Side, price: Decimal, quantity: Decimal) -> Result<()> {
        if price <= Decimal::ZERO {
            return Err(anyhow!("invalid price level {} for {}", price, self.symbol));
        }
        if quantity < Decimal::ZERO {
            return Err(anyhow!("negative quantity {} at {}", quantity, price));
        }

        let map = self.side_map(side);
        if quantity.is_zero() {
            map.remove(&price);
        } else {
            map.insert(price, quantity);
        }
        Ok(())
    }

    /// Replace the whole book with a REST depth snapshot
    pub fn apply_snapshot(
        &self,
        update_id: u64,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) -> Result<()> {
        self.bids.clear();
        self.asks.clear();

        for &(price, qty) in bids {
            self.update_level(Side::Buy, price, qty)?;
        }
        for &(price, qty) in asks {
            self.update_level(Side::Sell, price, qty)?;
        }

        self.last_update_id.store(update_id, Ordering::Release);
        Ok(())
    }

    /// Best N levels: highest bids first, lowest asks first
    pub fn top_levels(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        let mut levels: Vec<PriceLevel> = self
            .side_map(side)
            .iter()
            .map(|entry| PriceLevel {
                price: *entry.key(),
                quantity: *entry.value(),
            })
            .collect();

        match side {
            Side::Buy => levels.sort_by(|a, b| b.price.cmp(&a.price)),
            Side::Sell => levels.sort_by(|a, b| a.price.cmp(&b.price)),
        }
        levels.truncate(n);
        levels
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.top_levels(Side::Buy, 1).into_iter().next()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.top_levels(Side::Sell, 1).into_iter().next()
    }

    pub fn get_top_of_book(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        (self.best_bid(), self.best_ask())
    }

    pub fn get_mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }

    pub fn get_spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid.price + ask.price) / Decimal::TWO;
        if mid.is_zero() {
            return None;
        }
        Some((ask.price - bid.price) / mid * Decimal::from(10_000))
    }

    /// (bid level count, ask level count)
    pub fn get_book_depth_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    fn depth(&self, side: Side, levels: usize) -> Decimal {
        self.top_levels(side, levels)
            .iter()
            .map(|l| l.quantity)
            .sum()
    }

    /// Bid depth / ask depth over the top `levels` levels
    pub fn calculate_imbalance(&self, levels: usize) -> Option<f64> {
        let bid_depth = self.depth(Side::Buy, levels);
        let ask_depth = self.depth(Side::Sell, levels);

        if bid_depth.is_zero() || ask_depth.is_zero() {
            return None;
        }

        (bid_depth / ask_depth).to_f64()
    }

    /// (bid - ask) / (bid + ask) over the top `levels` levels, in [-1, 1]
    pub fn normalized_imbalance(&self, levels: usize) -> Option<f64> {
        let bid_depth = self.depth(Side::Buy, levels);
        let ask_depth = self.depth(Side::Sell, levels);
        let total = bid_depth + ask_depth;

        if total.is_zero() {
            return None;
        }

        ((bid_depth - ask_depth) / total).to_f64()
    }
}
