use crate::data::{Order, OrderRequest, OrderStatus, OrderType, Side};
use crate::exchange::binance::auth::get_timestamp;
use crate::exchange::error::ExchangeError;
use crate::exchange::filters::SymbolFilters;
use crate::exchange::gateway::OrderGateway;
use crate::risk::Position;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PaperPosition {
    amount: Decimal,
    entry: Decimal,
    opened_at: SystemTime,
}

impl Default for PaperPosition {
    fn default() -> Self {
        Self {
            amount: Decimal::ZERO,
            entry: Decimal::ZERO,
            opened_at: SystemTime::now(),
        }
    }
}

fn same_direction(a: Decimal, b: Decimal) -> bool {
    (a > Decimal::ZERO && b > Decimal::ZERO) || (a < Decimal::ZERO && b < Decimal::ZERO)
}

impl PaperPosition {
    /// Net a signed fill into the position, returning realized PnL
    fn apply_fill(&mut self, signed_qty: Decimal, price: Decimal) -> Decimal {
        let amount = self.amount;

        if amount.is_zero() || same_direction(amount, signed_qty) {
            let new_amount = amount + signed_qty;
            self.entry = (self.entry * amount.abs() + price * signed_qty.abs()) / new_amount.abs();
            if amount.is_zero() {
                self.opened_at = SystemTime::now();
            }
            self.amount = new_amount;
            return Decimal::ZERO;
        }

        let closing = signed_qty.abs().min(amount.abs());
        let direction = if amount > Decimal::ZERO { Decimal::ONE } else { Decimal::NEGATIVE_ONE };
        let realized = (price - self.entry) * closing * direction;
        let new_amount = amount + signed_qty;

        if new_amount.is_zero() {
            self.entry = Decimal::ZERO;
        } else if !same_direction(new_amount, amount) {
            // Flipped through zero
            self.entry = price;
            self.opened_at = SystemTime::now();
        }
        self.amount = new_amount;
        realized
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    order: Order,
    request: OrderRequest,
}

/// In-memory venue for paper trading
///
/// Market orders fill at the mark price plus slippage. Limit, stop and
/// take-profit orders rest until `set_mark` crosses them.
pub struct PaperGateway {
    filters: DashMap<String, SymbolFilters>,
    marks: DashMap<String, Decimal>,
    positions: DashMap<String, PaperPosition>,
    resting: DashMap<u64, RestingOrder>,
    realized: DashMap<String, Decimal>,
    next_order_id: AtomicU64,
    slippage_bps: Decimal,
}

impl PaperGateway {
    pub fn new(slippage_bps: Decimal) -> Self {
        Self {
            filters: DashMap::new(),
            marks: DashMap::new(),
            positions: DashMap::new(),
            resting: DashMap::new(),
            realized: DashMap::new(),
            next_order_id: AtomicU64::new(1),
            slippage_bps,
        }
    }

    /// Make a symbol tradeable
    pub fn register_symbol(&self, filters: SymbolFilters, mark: Decimal) {
        self.marks.insert(filters.symbol.clone(), mark);
        self.filters.insert(filters.symbol.clone(), filters);
    }

    pub fn realized_pnl(&self, symbol: &str) -> Decimal {
        self.realized.get(symbol).map(|r| *r).unwrap_or(Decimal::ZERO)
    }

    /// Signed open amount for a symbol
    pub fn position_amount(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Move the mark and fill any resting orders it crosses
    pub fn set_mark(&self, symbol: &str, price: Decimal) -> Vec<Order> {
        self.marks.insert(symbol.to_string(), price);

        let triggered: Vec<u64> = self
            .resting
            .iter()
            .filter(|entry| entry.request.symbol == symbol && Self::crosses(&entry.request, price))
            .map(|entry| *entry.key())
            .collect();

        let mut fills = Vec::new();
        for id in triggered {
            let Some((_, resting)) = self.resting.remove(&id) else {
                continue;
            };
            let fill_price = match resting.request.order_type {
                OrderType::Limit { price: limit, .. } => limit,
                _ => self.slipped(resting.request.side, price),
            };
            match self.fill_resting(resting, fill_price) {
                Some(order) => fills.push(order),
                None => debug!(symbol, order_id = id, "trigger expired with nothing to close"),
            }
        }
        fills
    }

    fn crosses(request: &OrderRequest, mark: Decimal) -> bool {
        match (request.order_type, request.side) {
            (OrderType::Limit { price, .. }, Side::Buy) => mark <= price,
            (OrderType::Limit { price, .. }, Side::Sell) => mark >= price,
            (OrderType::StopMarket { stop_price }, Side::Buy) => mark >= stop_price,
            (OrderType::StopMarket { stop_price }, Side::Sell) => mark <= stop_price,
            (OrderType::TakeProfitMarket { stop_price }, Side::Buy) => mark <= stop_price,
            (OrderType::TakeProfitMarket { stop_price }, Side::Sell) => mark >= stop_price,
            (OrderType::Market, _) => true,
        }
    }

    fn slipped(&self, side: Side, mark: Decimal) -> Decimal {
        let adj = mark * self.slippage_bps / Decimal::from(10_000);
        match side {
            Side::Buy => mark + adj,
            Side::Sell => mark - adj,
        }
    }

    fn mark(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.marks
            .get(symbol)
            .map(|m| *m)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    /// Quantity that may execute after reduce-only / close-position rules.
    /// None means nothing to reduce.
    fn executable_qty(&self, request: &OrderRequest) -> Result<Option<Decimal>, ExchangeError> {
        let open = self.position_amount(&request.symbol);
        let reduces = !open.is_zero() && !same_direction(open, request.side.sign());

        if request.close_position {
            return Ok(if reduces { Some(open.abs()) } else { None });
        }

        let qty = request
            .quantity
            .ok_or_else(|| ExchangeError::Rejected("quantity required".into()))?;
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!("invalid quantity {}", qty)));
        }

        if request.reduce_only {
            if !reduces {
                return Ok(None);
            }
            return Ok(Some(qty.min(open.abs())));
        }
        Ok(Some(qty))
    }

    fn fill(&self, symbol: &str, side: Side, qty: Decimal, price: Decimal) -> Decimal {
        let realized = {
            let mut position = self.positions.entry(symbol.to_string()).or_default();
            position.apply_fill(qty * side.sign(), price)
        };

        if self.position_amount(symbol).is_zero() {
            self.positions.remove(symbol);
        }
        *self.realized.entry(symbol.to_string()).or_insert(Decimal::ZERO) += realized;

        info!(symbol, %side, %qty, %price, %realized, "paper fill");
        realized
    }

    fn fill_resting(&self, resting: RestingOrder, price: Decimal) -> Option<Order> {
        let qty = self.executable_qty(&resting.request).ok().flatten()?;
        self.fill(&resting.request.symbol, resting.request.side, qty, price);

        let mut order = resting.order;
        order.status = OrderStatus::Filled;
        order.avg_price = price;
        order.executed_qty = qty;
        order.update_time = get_timestamp();
        Some(order)
    }

    fn new_order(&self, request: &OrderRequest) -> Order {
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Order {
            order_id,
            client_order_id: request
                .client_order_id
                .clone()
                .unwrap_or_else(|| format!("paper-{}", order_id)),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type.as_str().to_string(),
            status: OrderStatus::New,
            price: request.limit_price().unwrap_or(Decimal::ZERO),
            avg_price: Decimal::ZERO,
            orig_qty: request.quantity.unwrap_or(Decimal::ZERO),
            executed_qty: Decimal::ZERO,
            stop_price: request.stop_price().unwrap_or(Decimal::ZERO),
            reduce_only: request.reduce_only || request.close_position,
            close_position: request.close_position,
            update_time: get_timestamp(),
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.filters
            .get(symbol)
            .map(|f| f.clone())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.mark(symbol)
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let mut positions = Vec::new();
        for entry in self.positions.iter() {
            if entry.amount.is_zero() {
                continue;
            }
            let mark = self.mark(entry.key())?;
            let mut position = Position::from_signed(entry.key(), entry.amount, entry.entry, mark);
            position.opened_at = entry.opened_at;
            positions.push(position);
        }
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let mut orders: Vec<Order> = self
            .resting
            .iter()
            .filter(|entry| symbol.map_or(true, |s| entry.request.symbol == s))
            .map(|entry| entry.order.clone())
            .collect();
        orders.sort_by_key(|o| o.order_id);
        Ok(orders)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let mark = self.mark(&request.symbol)?;
        let mut order = self.new_order(request);

        let immediate = match request.order_type {
            OrderType::Market => true,
            OrderType::Limit { .. } => Self::crosses(request, mark),
            OrderType::StopMarket { .. } | OrderType::TakeProfitMarket { .. } => false,
        };

        if !immediate {
            if !request.close_position {
                self.executable_qty(request)?;
            }
            self.resting.insert(
                order.order_id,
                RestingOrder { order: order.clone(), request: request.clone() },
            );
            return Ok(order);
        }

        let qty = self.executable_qty(request)?.ok_or_else(|| ExchangeError::Api {
            status: 400,
            code: -2022,
            msg: "ReduceOnly Order is rejected.".into(),
        })?;
        let price = match request.order_type {
            OrderType::Limit { price, .. } => match request.side {
                Side::Buy => price.min(mark),
                Side::Sell => price.max(mark),
            },
            _ => self.slipped(request.side, mark),
        };

        self.fill(&request.symbol, request.side, qty, price);
        order.status = OrderStatus::Filled;
        order.avg_price = price;
        order.executed_qty = qty;
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        match self.resting.remove(&order_id) {
            Some((_, resting)) if resting.request.symbol == symbol => {
                let mut order = resting.order;
                order.status = OrderStatus::Canceled;
                order.update_time = get_timestamp();
                Ok(order)
            }
            Some((id, resting)) => {
                self.resting.insert(id, resting);
                Err(unknown_order())
            }
            None => Err(unknown_order()),
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.resting.retain(|_, resting| resting.request.symbol != symbol);
        Ok(())
    }
}

fn unknown_order() -> ExchangeError {
    ExchangeError::Api {
        status: 400,
        code: -2011,
        msg: "Unknown order sent.".into(),
    }
}
