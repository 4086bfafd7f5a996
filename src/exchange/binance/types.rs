//! Wire types for the USDⓈ-M futures REST API.
//!
//! Numeric fields arrive as strings; conversions into the domain types parse
//! them into `Decimal`.

use crate::data::{Balance, Candle, Order, OrderStatus, Side};
use crate::exchange::error::ExchangeError;
use crate::exchange::filters::SymbolFilters;
use crate::risk::Position;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ExchangeError> {
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw)
        .map_err(|e| ExchangeError::Malformed(format!("{} '{}': {}", field, raw, e)))
}

/// `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTime {
    #[serde(rename = "serverTime")]
    pub server_time: u64,
}

/// Order response from REST API
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: u64,
    pub symbol: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub orig_qty: String,
    #[serde(default)]
    pub executed_qty: String,
    #[serde(default)]
    pub stop_price: String,
    pub status: String,
    #[serde(default)]
    pub time_in_force: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub update_time: u64,
}

impl TryFrom<OrderResponse> for Order {
    type Error = ExchangeError;

    fn try_from(r: OrderResponse) -> Result<Self, Self::Error> {
        let side = Side::from_str(&r.side).map_err(ExchangeError::Malformed)?;
        let status = OrderStatus::from_str(&r.status).map_err(ExchangeError::Malformed)?;

        Ok(Order {
            order_id: r.order_id,
            price: parse_decimal("price", &r.price)?,
            avg_price: parse_decimal("avgPrice", &r.avg_price)?,
            orig_qty: parse_decimal("origQty", &r.orig_qty)?,
            executed_qty: parse_decimal("executedQty", &r.executed_qty)?,
            stop_price: parse_decimal("stopPrice", &r.stop_price)?,
            client_order_id: r.client_order_id,
            symbol: r.symbol,
            side,
            order_type: r.order_type,
            status,
            reduce_only: r.reduce_only,
            close_position: r.close_position,
            update_time: r.update_time,
        })
    }
}

/// Entry of `/fapi/v2/balance`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    pub balance: String,
    #[serde(default)]
    pub cross_un_pnl: String,
    pub available_balance: String,
}

impl TryFrom<BalanceEntry> for Balance {
    type Error = ExchangeError;

    fn try_from(b: BalanceEntry) -> Result<Self, Self::Error> {
        Ok(Balance {
            wallet_balance: parse_decimal("balance", &b.balance)?,
            unrealized_pnl: parse_decimal("crossUnPnl", &b.cross_un_pnl)?,
            available: parse_decimal("availableBalance", &b.available_balance)?,
            asset: b.asset,
        })
    }
}

/// Entry of `/fapi/v2/positionRisk`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    pub mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: String,
    #[serde(default)]
    pub liquidation_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub margin_type: String,
}

impl PositionRisk {
    pub fn is_flat(&self) -> bool {
        parse_decimal("positionAmt", &self.position_amt)
            .map(|amt| amt.is_zero())
            .unwrap_or(true)
    }

    pub fn to_position(&self) -> Result<Position, ExchangeError> {
        let amount = parse_decimal("positionAmt", &self.position_amt)?;
        let entry = parse_decimal("entryPrice", &self.entry_price)?;
        let mark = parse_decimal("markPrice", &self.mark_price)?;

        let mut position = Position::from_signed(&self.symbol, amount, entry, mark);
        position.unrealized_pnl = parse_decimal("unRealizedProfit", &self.unrealized_profit)?;
        position.leverage = self.leverage.parse().unwrap_or(1);

        let liquidation = parse_decimal("liquidationPrice", &self.liquidation_price)?;
        position.liquidation_price = if liquidation.is_zero() { None } else { Some(liquidation) };

        Ok(position)
    }
}

/// `/fapi/v1/depth`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

fn parse_levels(levels: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>, ExchangeError> {
    levels
        .iter()
        .map(|[price, qty]| Ok((parse_decimal("depth price", price)?, parse_decimal("depth qty", qty)?)))
        .collect()
}

impl DepthSnapshot {
    pub fn parse_bids(&self) -> Result<Vec<(Decimal, Decimal)>, ExchangeError> {
        parse_levels(&self.bids)
    }

    pub fn parse_asks(&self) -> Result<Vec<(Decimal, Decimal)>, ExchangeError> {
        parse_levels(&self.asks)
    }
}

/// One row of `/fapi/v1/klines`
///
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBuyBase, takerBuyQuote, ignore]`
pub type KlineRow = (
    u64,
    String,
    String,
    String,
    String,
    String,
    u64,
    String,
    u64,
    String,
    String,
    String,
);

pub fn candle_from_row(row: &KlineRow) -> Result<Candle, ExchangeError> {
    Ok(Candle {
        open_time: row.0,
        open: parse_decimal("open", &row.1)?,
        high: parse_decimal("high", &row.2)?,
        low: parse_decimal("low", &row.3)?,
        close: parse_decimal("close", &row.4)?,
        volume: parse_decimal("volume", &row.5)?,
        close_time: row.6,
    })
}

/// `/fapi/v1/premiumIndex`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: String,
    #[serde(default)]
    pub last_funding_rate: String,
    #[serde(default)]
    pub next_funding_time: u64,
}

/// `/fapi/v1/leverage` response
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageResponse {
    pub leverage: u32,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginType {
    Isolated,
    Crossed,
}

impl MarginType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Crossed => "CROSSED",
        }
    }
}

impl FromStr for MarginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ISOLATED" => Ok(MarginType::Isolated),
            "CROSSED" | "CROSS" => Ok(MarginType::Crossed),
            other => Err(format!("unknown margin type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum Filter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price { tick_size: String },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: String, min_qty: String, max_qty: String },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: String },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    pub fn to_filters(&self) -> Result<SymbolFilters, ExchangeError> {
        let mut filters = SymbolFilters {
            symbol: self.symbol.clone(),
            tick_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_qty: Decimal::ZERO,
            max_qty: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };

        for filter in &self.filters {
            match filter {
                Filter::Price { tick_size } => {
                    filters.tick_size = parse_decimal("tickSize", tick_size)?.normalize();
                }
                Filter::LotSize { step_size, min_qty, max_qty } => {
                    filters.step_size = parse_decimal("stepSize", step_size)?.normalize();
                    filters.min_qty = parse_decimal("minQty", min_qty)?;
                    filters.max_qty = parse_decimal("maxQty", max_qty)?;
                }
                Filter::MinNotional { notional } => {
                    filters.min_notional = parse_decimal("notional", notional)?;
                }
                Filter::Other => {}
            }
        }

        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_order_response() {
        let json = r#"{
            "orderId": 8389765519,
            "symbol": "ETHUSDT",
            "status": "FILLED",
            "clientOrderId": "desk-1",
            "price": "0.00",
            "avgPrice": "3012.45",
            "origQty": "0.100",
            "executedQty": "0.100",
            "cumQuote": "301.245",
            "timeInForce": "GTC",
            "type": "MARKET",
            "reduceOnly": true,
            "closePosition": false,
            "side": "SELL",
            "positionSide": "BOTH",
            "stopPrice": "0.00",
            "updateTime": 1700000000000
        }"#;

        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let order = Order::try_from(response).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.fill_price(), dec!(3012.45));
        assert!(order.reduce_only);
        assert!(!order.close_position);
    }

    #[test]
    fn test_close_position_trigger_is_a_bracket() {
        let json = r#"{
            "orderId": 8389765520,
            "symbol": "ETHUSDT",
            "status": "NEW",
            "clientOrderId": "desk-2",
            "price": "0",
            "avgPrice": "0",
            "origQty": "0",
            "executedQty": "0",
            "type": "TAKE_PROFIT_MARKET",
            "reduceOnly": true,
            "closePosition": true,
            "side": "SELL",
            "stopPrice": "3100.00",
            "updateTime": 1700000000000
        }"#;

        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let order = Order::try_from(response).unwrap();
        assert!(order.close_position);
        assert!(order.is_bracket());
        assert_eq!(order.stop_price, dec!(3100));
    }

    #[test]
    fn test_bad_depth_level_is_malformed() {
        let json = r#"{"lastUpdateId": 7, "bids": [["101.5", "2"], ["oops", "1"]], "asks": [["101.6", "x"]]}"#;
        let depth: DepthSnapshot = serde_json::from_str(json).unwrap();

        assert!(matches!(depth.parse_bids(), Err(ExchangeError::Malformed(_))));
        assert!(matches!(depth.parse_asks(), Err(ExchangeError::Malformed(_))));
    }

    #[test]
    fn test_parse_position_risk() {
        let json = r#"{
            "symbol": "DOGEUSDT",
            "positionAmt": "-1500",
            "entryPrice": "0.1600",
            "markPrice": "0.1550",
            "unRealizedProfit": "7.50",
            "liquidationPrice": "0.3100",
            "leverage": "5",
            "maxNotionalValue": "1000000",
            "marginType": "cross",
            "isolatedMargin": "0.00000000",
            "isAutoAddMargin": "false",
            "positionSide": "BOTH",
            "notional": "-232.5",
            "updateTime": 1700000000000
        }"#;

        let risk: PositionRisk = serde_json::from_str(json).unwrap();
        assert!(!risk.is_flat());
        let pos = risk.to_position().unwrap();
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.quantity, dec!(1500));
        assert_eq!(pos.leverage, 5);
        assert_eq!(pos.liquidation_price, Some(dec!(0.3100)));
        assert_eq!(pos.unrealized_pnl, dec!(7.50));
    }

    #[test]
    fn test_parse_kline_row() {
        let json = r#"[[1700000000000,"100.0","101.5","99.0","101.0","1234.5",1700000059999,"124000.0",321,"600.0","60000.0","0"]]"#;
        let rows: Vec<KlineRow> = serde_json::from_str(json).unwrap();
        let candle = candle_from_row(&rows[0]).unwrap();
        assert_eq!(candle.close, dec!(101.0));
        assert_eq!(candle.close_time, 1700000059999);
    }

    #[test]
    fn test_parse_exchange_info_filters() {
        let json = r#"{
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "556.80", "maxPrice": "4529764", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "maxQty": "1000", "minQty": "0.001"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "maxQty": "120", "minQty": "0.001"},
                    {"filterType": "MAX_NUM_ORDERS", "limit": 200},
                    {"filterType": "MIN_NOTIONAL", "notional": "100"},
                    {"filterType": "PERCENT_PRICE", "multiplierUp": "1.0500", "multiplierDown": "0.9500", "multiplierDecimal": "4"}
                ]
            }]
        }"#;

        let info: ExchangeInfo = serde_json::from_str(json).unwrap();
        let filters = info.symbols[0].to_filters().unwrap();
        assert_eq!(filters.tick_size, dec!(0.1));
        assert_eq!(filters.step_size, dec!(0.001));
        assert_eq!(filters.min_notional, dec!(100));
    }
}
