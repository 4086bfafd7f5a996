use crate::data::{Order, OrderRequest};
use crate::exchange::error::ExchangeError;
use crate::exchange::filters::SymbolFilters;
use crate::risk::Position;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Everything the execution engine needs from a venue
///
/// Implemented by the live REST client and by the in-memory paper gateway.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Open (non-zero) positions only
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError>;
}
