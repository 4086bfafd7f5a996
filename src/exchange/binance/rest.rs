use crate::data::{Balance, Candle, KlineInterval, Order, OrderRequest, OrderType, Side};
use crate::exchange::binance::auth::{self, Credentials, TimeSync};
use crate::exchange::binance::retry::{retry_async, RetryPolicy};
use crate::exchange::binance::types::{
    candle_from_row, ApiErrorBody, BalanceEntry, DepthSnapshot, ExchangeInfo, KlineRow,
    LeverageResponse, MarginType, OrderResponse, PositionRisk, PremiumIndex, ServerTime,
};
use crate::exchange::error::ExchangeError;
use crate::exchange::filters::SymbolFilters;
use crate::exchange::gateway::OrderGateway;
use crate::risk::Position;
use crate::utils::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// "No need to change margin type."
const NO_MARGIN_CHANGE: i64 = -4046;

#[derive(Debug, Clone)]
pub struct RestSettings {
    pub timeout: Duration,
    pub recv_window_ms: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            recv_window_ms: Some(5000),
            retry: RetryPolicy::default(),
        }
    }
}

/// Binance USDⓈ-M Futures REST API client
///
/// Public market-data calls work without credentials; account and order
/// calls need them.
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    settings: RestSettings,
    time_sync: TimeSync,
    filters: DashMap<String, SymbolFilters>,
    metrics: Arc<Metrics>,
}

/// Query parameters for a new order
pub fn order_params(request: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", request.symbol.clone()),
        ("side", request.side.as_str().to_string()),
        ("type", request.order_type.as_str().to_string()),
    ];

    match request.order_type {
        OrderType::Market => {}
        OrderType::Limit { price, time_in_force } => {
            params.push(("timeInForce", time_in_force.as_str().to_string()));
            params.push(("price", price.normalize().to_string()));
        }
        OrderType::StopMarket { stop_price } | OrderType::TakeProfitMarket { stop_price } => {
            params.push(("stopPrice", stop_price.normalize().to_string()));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
    }

    if let Some(qty) = request.quantity {
        params.push(("quantity", qty.normalize().to_string()));
    }
    if request.close_position {
        params.push(("closePosition", "true".to_string()));
    } else if request.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    if let Some(id) = &request.client_order_id {
        params.push(("newClientOrderId", id.clone()));
    }
    params.push(("newOrderRespType", "RESULT".to_string()));
    params
}

impl BinanceRestClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        settings: RestSettings,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            settings,
            time_sync: TimeSync::new(),
            filters: DashMap::new(),
            metrics: Arc::new(Metrics::new()?),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_sync.offset_ms()
    }

    fn credentials(&self) -> Result<&Credentials, ExchangeError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Credentials("no API credentials configured".into()))
    }

    /// Send one request and decode the JSON body
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<String>,
        body: Option<String>,
        api_key: Option<&str>,
    ) -> Result<T, ExchangeError> {
        let started = Instant::now();
        let url = match &query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, endpoint, q),
            _ => format!("{}{}", self.base_url, endpoint),
        };

        let mut request = self.client.request(method.clone(), &url);
        if let Some(key) = api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body);
        }

        let result: Result<T, ExchangeError> = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;

            if !status.is_success() {
                return Err(match serde_json::from_str::<ApiErrorBody>(&text) {
                    Ok(api) => ExchangeError::Api {
                        status: status.as_u16(),
                        code: api.code,
                        msg: api.msg,
                    },
                    Err(_) => ExchangeError::Http { status: status.as_u16(), body: text },
                });
            }

            Ok(serde_json::from_str::<T>(&text)?)
        }
        .await;

        self.metrics
            .observe_request(endpoint, result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            debug!(%method, endpoint, error = %e, "request failed");
        }
        result
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();

        retry_async(&self.settings.retry, endpoint, || {
            self.execute(Method::GET, endpoint, Some(query.clone()), None, None)
        })
        .await
    }

    async fn signed_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let creds = self.credentials()?;
        let signed = auth::build_signed_query(
            params,
            &creds.signer,
            self.time_sync.timestamp(),
            self.settings.recv_window_ms,
        )?;

        if *method == Method::POST {
            self.execute(method.clone(), endpoint, None, Some(signed), Some(&creds.api_key))
                .await
        } else {
            self.execute(method.clone(), endpoint, Some(signed), None, Some(&creds.api_key))
                .await
        }
    }

    /// Signed request; GET/DELETE are retried, POST never is
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        if method == Method::POST {
            return self.signed_once(&method, endpoint, params).await;
        }
        retry_async(&self.settings.retry, endpoint, || {
            self.signed_once(&method, endpoint, params)
        })
        .await
    }

    /// Test connectivity to the API
    pub async fn test_connectivity(&self) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.public_get("/fapi/v1/ping", &[]).await?;
        Ok(())
    }

    /// Exchange time in milliseconds
    pub async fn get_server_time(&self) -> Result<u64, ExchangeError> {
        let time: ServerTime = self.public_get("/fapi/v1/time", &[]).await?;
        Ok(time.server_time)
    }

    /// Measure the clock offset against the server and apply it to signing
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let before = auth::get_timestamp();
        let server = self.get_server_time().await?;
        let after = auth::get_timestamp();

        self.time_sync.update(server, before + (after - before) / 2);
        let offset = self.time_sync.offset_ms();
        info!(offset_ms = offset, "clock synced with exchange");
        Ok(offset)
    }

    /// Trading rules for a symbol, cached after the first exchangeInfo call
    pub async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(cached) = self.filters.get(symbol) {
            return Ok(cached.clone());
        }

        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        for entry in &info.symbols {
            match entry.to_filters() {
                Ok(filters) => {
                    self.filters.insert(entry.symbol.clone(), filters);
                }
                Err(e) => warn!(symbol = %entry.symbol, error = %e, "skipping unparseable filters"),
            }
        }

        self.filters
            .get(symbol)
            .map(|f| f.clone())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    pub async fn get_order_book(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("limit", limit.to_string())];
        self.public_get("/fapi/v1/depth", &params).await
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<KlineRow> = self.public_get("/fapi/v1/klines", &params).await?;
        rows.iter().map(candle_from_row).collect()
    }

    pub async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let index: PremiumIndex = self.public_get("/fapi/v1/premiumIndex", &params).await?;
        Decimal::from_str(&index.mark_price)
            .map_err(|e| ExchangeError::Malformed(format!("markPrice '{}': {}", index.mark_price, e)))
    }

    /// Non-zero wallet balances
    pub async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let entries: Vec<BalanceEntry> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;

        let mut balances = Vec::new();
        for entry in entries {
            let balance = Balance::try_from(entry)?;
            if !balance.wallet_balance.is_zero() || !balance.unrealized_pnl.is_zero() {
                balances.push(balance);
            }
        }
        Ok(balances)
    }

    /// Open positions (zero `positionAmt` rows are dropped)
    pub async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let rows: Vec<PositionRisk> = self.signed(Method::GET, "/fapi/v2/positionRisk", &[]).await?;

        let positions = rows
            .iter()
            .filter(|r| !r.is_flat())
            .map(PositionRisk::to_position)
            .collect::<Result<Vec<_>, _>>()?;

        self.metrics.set_open_positions(positions.len());
        Ok(positions)
    }

    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let rows: Vec<OrderResponse> = self.signed(Method::GET, "/fapi/v1/openOrders", &params).await?;
        rows.into_iter().map(Order::try_from).collect()
    }

    /// Submit an order. Never retried.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let params = order_params(request);
        info!(
            symbol = %request.symbol,
            side = %request.side,
            kind = request.order_type.as_str(),
            qty = ?request.quantity,
            reduce_only = request.reduce_only,
            "placing order"
        );

        let response: OrderResponse = match self.signed(Method::POST, "/fapi/v1/order", &params).await {
            Ok(r) => r,
            Err(e) => {
                error!(symbol = %request.symbol, error = %e, "order rejected");
                return Err(e);
            }
        };

        let order = Order::try_from(response)?;
        self.metrics
            .record_order(request.side.as_str(), request.order_type.as_str());
        info!(
            order_id = order.order_id,
            status = ?order.status,
            fill_price = %order.fill_price(),
            executed = %order.executed_qty,
            "order accepted"
        );
        Ok(order)
    }

    pub async fn place_market_order(&self, symbol: &str, side: Side, quantity: Decimal) -> Result<Order, ExchangeError> {
        self.place_order(&OrderRequest::market(symbol, side, quantity)).await
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.place_order(&OrderRequest::limit(symbol, side, price, quantity)).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let response: OrderResponse = self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        info!(symbol, order_id, "order cancelled");
        Order::try_from(response)
    }

    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let _: serde_json::Value = self
            .signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        info!(symbol, "all open orders cancelled");
        Ok(())
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<u32, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        let response: LeverageResponse = self.signed(Method::POST, "/fapi/v1/leverage", &params).await?;
        info!(symbol, leverage = response.leverage, "leverage set");
        Ok(response.leverage)
    }

    /// Switch margin mode; already being in that mode counts as success
    pub async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("marginType", margin_type.as_str().to_string()),
        ];
        match self
            .signed::<serde_json::Value>(Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.api_code() == Some(NO_MARGIN_CHANGE) => {
                debug!(symbol, "margin type unchanged");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl OrderGateway for BinanceRestClient {
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.get_symbol_filters(symbol).await
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.get_mark_price(symbol).await
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.get_positions().await
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        self.get_open_orders(symbol).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        BinanceRestClient::place_order(self, request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        BinanceRestClient::cancel_order(self, symbol, order_id).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        BinanceRestClient::cancel_all_orders(self, symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_creation() {
        let client = BinanceRestClient::new(
            "https://testnet.binancefuture.com/",
            None,
            RestSettings::default(),
        )
        .unwrap();

        assert_eq!(client.base_url(), "https://testnet.binancefuture.com");
        assert!(!client.has_credentials());
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials() {
        let client = BinanceRestClient::new("http://127.0.0.1:9", None, RestSettings::default()).unwrap();
        let err = client.get_balances().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Credentials(_)));
    }

    #[test]
    fn test_market_order_params() {
        let req = OrderRequest::market("ETHUSDT", Side::Sell, dec!(0.100)).reduce_only();
        let params = order_params(&req);
        assert!(params.contains(&("type", "MARKET".to_string())));
        assert!(params.contains(&("quantity", "0.1".to_string())));
        assert!(params.contains(&("reduceOnly", "true".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "price"));
    }

    #[test]
    fn test_close_position_params_skip_reduce_only() {
        let req = OrderRequest::stop_market_close("BTCUSDT", Side::Sell, dec!(41000.5)).reduce_only();
        let params = order_params(&req);
        assert!(params.contains(&("closePosition", "true".to_string())));
        assert!(params.contains(&("stopPrice", "41000.5".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "reduceOnly" || *k == "quantity"));
    }

    #[test]
    fn test_limit_order_params() {
        let req = OrderRequest::limit("DOGEUSDT", Side::Buy, dec!(0.15200), dec!(1000))
            .with_client_id("fix-doge");
        let params = order_params(&req);
        assert!(params.contains(&("timeInForce", "GTC".to_string())));
        assert!(params.contains(&("price", "0.152".to_string())));
        assert!(params.contains(&("newClientOrderId", "fix-doge".to_string())));
    }
}
