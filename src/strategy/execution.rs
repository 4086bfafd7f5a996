use crate::data::{Order, OrderRequest, Side};
use crate::exchange::{OrderGateway, SymbolFilters};
use crate::risk::{ClosedTrade, Position, PositionBook, RiskManager, RiskViolation, ViolationSeverity};
use crate::strategy::CompositeSignal;
use anyhow::{anyhow, bail, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{error, info, warn};

/// Sizing, exit and fee parameters for the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Notional (USD) at confidence 0 scaled by the multipliers below
    pub base_position_size: Decimal,
    pub min_size_multiplier: Decimal,
    pub max_size_multiplier: Decimal,

    pub take_profit_bps: Decimal,
    pub stop_loss_bps: Decimal,
    pub max_hold_time_ms: u64,

    pub leverage: u32,

    /// Binance futures taker fee: 0.04%
    pub taker_fee_rate: Decimal,

    /// Place exchange-side STOP_MARKET / TAKE_PROFIT_MARKET after entry
    pub attach_brackets: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_position_size: Decimal::from(100),
            min_size_multiplier: Decimal::new(5, 1),
            max_size_multiplier: Decimal::from(2),
            take_profit_bps: Decimal::from(30),
            stop_loss_bps: Decimal::from(20),
            max_hold_time_ms: 3_600_000,
            leverage: 1,
            taker_fee_rate: Decimal::new(4, 4),
            attach_brackets: false,
        }
    }
}

/// Trade execution result
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub executed_price: Decimal,
    pub executed_qty: Decimal,
    pub latency_ms: u64,
    pub fees: Decimal,
    pub timestamp: SystemTime,
}

/// Outcome of cancelling and closing everything
#[derive(Debug, Clone, Default)]
pub struct FlattenReport {
    /// Symbols whose open orders were cancelled
    pub cancelled: Vec<String>,
    /// Closed positions with realized PnL
    pub closed: Vec<(String, Decimal)>,
    /// Per-symbol failures; other symbols still proceed
    pub failures: Vec<(String, String)>,
}

impl FlattenReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Execution engine over any order gateway
pub struct ExecutionEngine<G: OrderGateway> {
    gateway: Arc<G>,
    positions: PositionBook,
    risk_manager: RiskManager,
    settings: EngineSettings,
}

impl<G: OrderGateway> ExecutionEngine<G> {
    pub fn new(gateway: Arc<G>, risk_manager: RiskManager, settings: EngineSettings) -> Self {
        Self {
            gateway,
            positions: PositionBook::new(),
            risk_manager,
            settings,
        }
    }

    /// Sync the local position book from the venue
    ///
    /// Anything that shrank without going through the engine (a bracket
    /// firing, a liquidation, a manual close elsewhere) is booked as a closed
    /// trade at the current mark, and leftover brackets on symbols that
    /// went flat or flipped are cancelled.
    pub async fn refresh_positions(&mut self) -> Result<()> {
        let snapshot = self.gateway.positions().await?;
        let marks: HashMap<String, Decimal> = snapshot
            .iter()
            .map(|p| (p.symbol.clone(), p.mark_price))
            .collect();

        for (position, quantity) in self.positions.sync(snapshot) {
            let exit_price = match marks.get(&position.symbol) {
                Some(&mark) => mark,
                None => match self.gateway.mark_price(&position.symbol).await {
                    Ok(mark) => mark,
                    Err(e) => {
                        warn!(symbol = %position.symbol, "Mark unavailable, using last seen: {}", e);
                        position.mark_price
                    }
                },
            };
            info!(symbol = %position.symbol, qty = %quantity, "Position reduced outside the engine");
            self.record_exit(&position, exit_price, quantity);

            let still_held = self
                .positions
                .get_position(&position.symbol)
                .map_or(false, |p| p.side == position.side);
            if !still_held {
                if let Err(e) = self.cancel_brackets(&position.symbol).await {
                    warn!(symbol = %position.symbol, "Failed to cancel leftover brackets: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Scale the base notional linearly from min to max multiplier
    pub fn calculate_position_size(&self, confidence: f64) -> Decimal {
        let confidence = Decimal::from_f64(confidence.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
        let multiplier = self.settings.min_size_multiplier
            + (self.settings.max_size_multiplier - self.settings.min_size_multiplier) * confidence;

        self.settings.base_position_size * multiplier
    }

    fn check_risk(&mut self, notional: Decimal) -> Result<()> {
        let exposure = self.positions.total_exposure();
        match self
            .risk_manager
            .can_open_position(notional, exposure, self.settings.leverage)
        {
            Ok(()) => Ok(()),
            Err(RiskViolation { severity: ViolationSeverity::Warning, reason }) => {
                warn!(%reason, "risk warning");
                Ok(())
            }
            Err(violation) => Err(anyhow::Error::new(violation)),
        }
    }

    /// Open a position in the direction of a composite signal
    pub async fn execute_signal(
        &mut self,
        symbol: &str,
        signal: &CompositeSignal,
        current_price: Decimal,
    ) -> Result<ExecutionResult> {
        if self.positions.get_position(symbol).is_some() {
            bail!("position already open in {}", symbol);
        }
        if current_price <= Decimal::ZERO {
            bail!("invalid reference price {} for {}", current_price, symbol);
        }

        let signal_time = Instant::now();
        let notional = self.calculate_position_size(signal.confidence);
        self.check_risk(notional)?;

        let filters = self.gateway.symbol_filters(symbol).await?;
        let quantity = filters.floor_qty(notional / current_price);
        filters.validate(quantity, current_price)?;

        info!(
            symbol,
            side = %signal.direction,
            %notional,
            %quantity,
            price = %current_price,
            confidence = signal.confidence,
            sources = ?signal.sources(),
            "Executing signal"
        );

        let order = self
            .gateway
            .place_order(&OrderRequest::market(symbol, signal.direction, quantity))
            .await?;

        let latency_ms = signal_time.elapsed().as_millis() as u64;
        self.risk_manager.record_latency(latency_ms);

        let executed_price = non_zero_or(order.fill_price(), current_price);
        let executed_qty = non_zero_or(order.executed_qty, quantity);
        let fees = executed_price * executed_qty * self.settings.taker_fee_rate;
        self.positions.record_fee(fees);

        self.refresh_positions().await?;

        info!(
            order_id = order.order_id,
            price = %executed_price,
            qty = %executed_qty,
            latency_ms,
            "Order executed"
        );

        if self.settings.attach_brackets {
            if let Err(e) = self.place_brackets(symbol).await {
                warn!(symbol, "Failed to attach brackets: {}", e);
            }
        }

        Ok(ExecutionResult {
            order_id: order.order_id,
            symbol: symbol.to_string(),
            side: signal.direction,
            executed_price,
            executed_qty,
            latency_ms,
            fees,
            timestamp: SystemTime::now(),
        })
    }

    /// Manual order path: round to filters, validate, risk-check openers
    pub async fn submit(&mut self, mut request: OrderRequest, reference_price: Decimal) -> Result<Order> {
        let filters = self.gateway.symbol_filters(&request.symbol).await?;
        round_to_filters(&mut request, &filters);

        if let Some(qty) = request.quantity {
            let price = request.limit_price().unwrap_or(reference_price);
            filters.validate(qty, price)?;

            if !request.reduce_only {
                self.check_risk(qty * price)?;
            }
        }

        let order = self.gateway.place_order(&request).await?;
        info!(
            symbol = %order.symbol,
            order_id = order.order_id,
            side = %order.side,
            kind = %order.order_type,
            status = ?order.status,
            "Order submitted"
        );
        Ok(order)
    }

    fn should_exit(&self, position: &Position, price: Decimal) -> bool {
        if position.take_profit_hit(price, self.settings.take_profit_bps) {
            info!(symbol = %position.symbol, %price, "Take profit hit");
            return true;
        }
        if position.stop_loss_hit(price, self.settings.stop_loss_bps) {
            info!(symbol = %position.symbol, %price, "Stop loss hit");
            return true;
        }
        if position.is_expired(self.settings.max_hold_time_ms) {
            info!(symbol = %position.symbol, "Max hold time reached");
            return true;
        }
        false
    }

    /// Close every position whose exit condition is met at the given marks
    ///
    /// A failed close is logged and the remaining symbols are still checked.
    pub async fn check_exits(&mut self, marks: &HashMap<String, Decimal>) -> Result<Vec<(String, Decimal)>> {
        let mut closed = Vec::new();

        for position in self.positions.open_positions() {
            let Some(&price) = marks.get(&position.symbol) else {
                continue;
            };
            if !self.should_exit(&position, price) {
                continue;
            }
            match self.close_position(&position.symbol).await {
                Ok(Some(pnl)) => closed.push((position.symbol.clone(), pnl)),
                Ok(None) => {}
                Err(e) => error!(symbol = %position.symbol, "Exit failed: {}", e),
            }
        }

        Ok(closed)
    }

    /// Reduce-only market close of the whole position; None when flat
    pub async fn close_position(&mut self, symbol: &str) -> Result<Option<Decimal>> {
        self.refresh_positions().await?;
        let Some(position) = self.positions.get_position(symbol).cloned() else {
            info!(symbol, "Nothing to close");
            if let Err(e) = self.cancel_brackets(symbol).await {
                warn!(symbol, "Failed to cancel leftover brackets: {}", e);
            }
            return Ok(None);
        };

        info!(
            symbol,
            side = %position.side,
            entry = %position.entry_price,
            qty = %position.quantity,
            "Closing position"
        );

        let request = OrderRequest::market(symbol, position.close_side(), position.quantity).reduce_only();
        let order = self.gateway.place_order(&request).await?;
        let pnl = self.book_exit(&position, &order).await?;

        if let Err(e) = self.cancel_brackets(symbol).await {
            warn!(symbol, "Failed to cancel brackets after close: {}", e);
        }
        self.refresh_positions().await?;
        Ok(Some(pnl))
    }

    /// Record a reducing fill placed by the engine
    async fn book_exit(&mut self, position: &Position, order: &Order) -> Result<Decimal> {
        let exit_price = match order.fill_price() {
            p if p.is_zero() => self.gateway.mark_price(&position.symbol).await?,
            p => p,
        };
        let exit_qty = non_zero_or(order.executed_qty, position.quantity).min(position.quantity);

        self.positions.reduce(&position.symbol, exit_qty);
        Ok(self.record_exit(position, exit_price, exit_qty))
    }

    /// Book a closed trade and feed its PnL to risk
    fn record_exit(&mut self, position: &Position, exit_price: Decimal, quantity: Decimal) -> Decimal {
        let fees = exit_price * quantity * self.settings.taker_fee_rate;
        let trade = ClosedTrade::from_exit(position, exit_price, quantity, fees);
        let pnl = trade.realized_pnl;
        self.positions.record_close(trade);
        self.risk_manager.record_trade(pnl);

        info!(
            symbol = %position.symbol,
            exit = %exit_price,
            qty = %quantity,
            %pnl,
            %fees,
            "Position reduced"
        );
        pnl
    }

    /// Cancel close-position triggers resting on a symbol
    async fn cancel_brackets(&self, symbol: &str) -> Result<usize> {
        let mut cancelled = 0;
        for order in self.gateway.open_orders(Some(symbol)).await? {
            if order.is_bracket() {
                self.gateway.cancel_order(symbol, order.order_id).await?;
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(symbol, cancelled, "Brackets cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel all orders and close all positions, symbol by symbol
    pub async fn flatten_all(&mut self) -> Result<FlattenReport> {
        self.refresh_positions().await?;
        let open_orders = self.gateway.open_orders(None).await?;

        let mut symbols: BTreeSet<String> = open_orders.into_iter().map(|o| o.symbol).collect();
        symbols.extend(self.positions.open_positions().into_iter().map(|p| p.symbol));

        let mut report = FlattenReport::default();
        for symbol in symbols {
            match self.gateway.cancel_all_orders(&symbol).await {
                Ok(()) => report.cancelled.push(symbol.clone()),
                Err(e) => {
                    error!(symbol = %symbol, "Cancel all failed: {}", e);
                    report.failures.push((symbol.clone(), e.to_string()));
                }
            }

            if self.positions.get_position(&symbol).is_none() {
                continue;
            }
            match self.close_position(&symbol).await {
                Ok(Some(pnl)) => report.closed.push((symbol, pnl)),
                Ok(None) => {}
                Err(e) => {
                    error!(symbol = %symbol, "Close failed: {}", e);
                    report.failures.push((symbol, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Move the signed position in `symbol` to `target`
    ///
    /// Reductions are reduce-only; a flip closes first and then opens.
    pub async fn rebalance_to(&mut self, symbol: &str, target: Decimal) -> Result<Vec<Order>> {
        self.refresh_positions().await?;
        let filters = self.gateway.symbol_filters(symbol).await?;
        let position = self.positions.get_position(symbol).cloned();
        let current = position.as_ref().map_or(Decimal::ZERO, Position::signed_quantity);

        let delta = target - current;
        if delta.abs() < filters.step_size || delta.is_zero() {
            info!(symbol, %current, %target, "Position already at target");
            return Ok(Vec::new());
        }

        let mark = self.gateway.mark_price(symbol).await?;
        let flips = !current.is_zero() && !target.is_zero() && (current > Decimal::ZERO) != (target > Decimal::ZERO);
        let reduces = !current.is_zero() && (target.is_zero() || flips || target.abs() < current.abs());

        let mut orders = Vec::new();
        let open_qty = if reduces {
            let (reduce_qty, open_qty) = if flips {
                (current.abs(), filters.floor_qty(target.abs()))
            } else {
                (filters.floor_qty(delta.abs()), Decimal::ZERO)
            };

            if let Some(position) = position.as_ref() {
                let request = OrderRequest::market(symbol, position.close_side(), reduce_qty).reduce_only();
                let order = self.gateway.place_order(&request).await?;
                self.book_exit(position, &order).await?;
                orders.push(order);
            }
            // Old triggers would close whatever is opened next
            if target.is_zero() || flips {
                self.cancel_brackets(symbol).await?;
            }
            open_qty
        } else {
            filters.floor_qty(delta.abs())
        };

        if !open_qty.is_zero() {
            let side = if target > current { Side::Buy } else { Side::Sell };
            filters.validate(open_qty, mark)?;
            self.check_risk(open_qty * mark)?;
            let order = self
                .gateway
                .place_order(&OrderRequest::market(symbol, side, open_qty))
                .await?;
            orders.push(order);
        }

        self.refresh_positions().await?;
        info!(symbol, %current, %target, orders = orders.len(), "Rebalanced");
        Ok(orders)
    }

    /// Exchange-side stop loss and take profit that close the whole position
    ///
    /// Any brackets already resting on the symbol are cancelled first.
    pub async fn place_brackets(&mut self, symbol: &str) -> Result<(Order, Order)> {
        self.refresh_positions().await?;
        let position = self
            .positions
            .get_position(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no open position in {}", symbol))?;
        let filters = self.gateway.symbol_filters(symbol).await?;
        // Replace rather than stack
        self.cancel_brackets(symbol).await?;

        let (stop_price, take_profit_price) = bracket_prices(
            &position,
            self.settings.stop_loss_bps,
            self.settings.take_profit_bps,
            &filters,
        );
        let close_side = position.close_side();

        let stop = self
            .gateway
            .place_order(&OrderRequest::stop_market_close(symbol, close_side, stop_price))
            .await?;
        let take_profit = self
            .gateway
            .place_order(&OrderRequest::take_profit_close(symbol, close_side, take_profit_price))
            .await?;

        info!(symbol, stop = %stop_price, take_profit = %take_profit_price, "Brackets placed");
        Ok((stop, take_profit))
    }

    /// Halt trading and flatten everything
    pub async fn emergency_close_all(&mut self) -> Result<FlattenReport> {
        warn!("EMERGENCY: cancelling orders and closing all positions");
        self.risk_manager.halt_trading("Emergency close");

        let report = self.flatten_all().await?;
        for (symbol, pnl) in &report.closed {
            info!(symbol = %symbol, pnl = %pnl, "Emergency closed");
        }
        for (symbol, reason) in &report.failures {
            error!(symbol = %symbol, "Failed to emergency close: {}", reason);
        }
        Ok(report)
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn risk_manager(&self) -> &RiskManager {
        &self.risk_manager
    }

    pub fn risk_manager_mut(&mut self) -> &mut RiskManager {
        &mut self.risk_manager
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn get_stats(&self) -> TradingStats {
        TradingStats {
            open_positions: self.positions.position_count(),
            closed_trades: self.positions.closed_trades().len(),
            total_realized_pnl: self.positions.total_realized_pnl(),
            total_fees: self.positions.total_fees(),
            win_rate: self.positions.win_rate(),
            average_trade_pnl: self.positions.average_trade_pnl(),
            risk_metrics: self.risk_manager.get_metrics(),
        }
    }
}

fn non_zero_or(value: Decimal, fallback: Decimal) -> Decimal {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

/// Round an order's quantity and prices onto the symbol grid
pub fn round_to_filters(request: &mut OrderRequest, filters: &SymbolFilters) {
    use crate::data::OrderType;

    request.quantity = request.quantity.map(|q| filters.floor_qty(q));
    request.order_type = match request.order_type {
        OrderType::Limit { price, time_in_force } => OrderType::Limit {
            price: filters.round_price(price),
            time_in_force,
        },
        OrderType::StopMarket { stop_price } => OrderType::StopMarket {
            stop_price: filters.round_price(stop_price),
        },
        OrderType::TakeProfitMarket { stop_price } => OrderType::TakeProfitMarket {
            stop_price: filters.round_price(stop_price),
        },
        OrderType::Market => OrderType::Market,
    };
}

/// (stop, take profit) trigger prices from entry and bps distances
pub fn bracket_prices(
    position: &Position,
    stop_loss_bps: Decimal,
    take_profit_bps: Decimal,
    filters: &SymbolFilters,
) -> (Decimal, Decimal) {
    let bps = Decimal::from(10_000);
    let entry = position.entry_price;
    let sign = position.side.sign();

    let stop = entry * (Decimal::ONE - sign * stop_loss_bps / bps);
    let take_profit = entry * (Decimal::ONE + sign * take_profit_bps / bps);
    (filters.round_price(stop), filters.round_price(take_profit))
}

#[derive(Debug, Clone)]
pub struct TradingStats {
    pub open_positions: usize,
    pub closed_trades: usize,
    pub total_realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub win_rate: f64,
    pub average_trade_pnl: Decimal,
    pub risk_metrics: crate::risk::RiskMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperGateway;
    use crate::risk::RiskLimits;
    use rust_decimal_macros::dec;

    fn engine() -> ExecutionEngine<PaperGateway> {
        let gateway = Arc::new(PaperGateway::new(Decimal::ZERO));
        gateway.register_symbol(
            SymbolFilters {
                symbol: "BTCUSDT".into(),
                tick_size: dec!(0.1),
                step_size: dec!(0.001),
                min_qty: dec!(0.001),
                max_qty: dec!(1000),
                min_notional: dec!(5),
            },
            dec!(50000),
        );
        let settings = EngineSettings {
            base_position_size: dec!(1000),
            ..EngineSettings::default()
        };
        ExecutionEngine::new(
            gateway,
            RiskManager::new(RiskLimits::default(), dec!(10000)),
            settings,
        )
    }

    #[test]
    fn test_position_size_calculation() {
        let engine = engine();
        assert_eq!(engine.calculate_position_size(0.0), dec!(500));
        assert_eq!(engine.calculate_position_size(0.5), dec!(1250));
        assert_eq!(engine.calculate_position_size(1.0), dec!(2000));
        assert_eq!(engine.calculate_position_size(7.0), dec!(2000));
    }

    #[test]
    fn test_bracket_prices() {
        let filters = SymbolFilters {
            symbol: "ETHUSDT".into(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            min_notional: dec!(5),
        };
        let long = Position::from_signed("ETHUSDT", dec!(1), dec!(2000), dec!(2000));
        assert_eq!(
            bracket_prices(&long, dec!(20), dec!(30), &filters),
            (dec!(1996), dec!(2006))
        );

        let short = Position::from_signed("ETHUSDT", dec!(-1), dec!(2000), dec!(2000));
        assert_eq!(
            bracket_prices(&short, dec!(20), dec!(30), &filters),
            (dec!(2004), dec!(1994))
        );
    }

    #[test]
    fn test_round_to_filters() {
        let filters = SymbolFilters {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.1),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            min_notional: dec!(5),
        };
        let mut request = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(50000.06), dec!(0.0129));
        round_to_filters(&mut request, &filters);
        assert_eq!(request.limit_price(), Some(dec!(50000.1)));
        assert_eq!(request.quantity, Some(dec!(0.012)));
    }

    #[tokio::test]
    async fn test_close_position_when_flat() {
        let mut engine = engine();
        assert_eq!(engine.close_position("BTCUSDT").await.unwrap(), None);
        assert_eq!(engine.get_stats().closed_trades, 0);
    }
}
