pub mod data;
pub mod exchange;
pub mod risk;
pub mod strategy;
pub mod utils;

// Re-export commonly used types
pub use data::{
    Balance, Candle, KlineInterval, Order, OrderBook, OrderRequest, OrderStatus, OrderType, PriceLevel, Side,
    Signal, SignalComponent, TimeInForce,
};
pub use exchange::binance::{Credentials, KeyType, MarginType, RestSettings};
pub use exchange::{
    BinanceRestClient, ExchangeError, MarketEvent, MarketPoller, MarketSnapshot, OrderGateway, PaperGateway,
    SymbolFilters,
};
pub use risk::{ClosedTrade, Position, PositionBook, RiskLimits, RiskManager, RiskViolation, ViolationSeverity};
pub use strategy::{
    BollingerSignal, CompositeSignal, EngineSettings, ExecutionEngine, FlattenReport, ImbalanceDetector, RsiSignal,
    SignalAggregator, TradingStats,
};
pub use utils::{Config, Metrics};
