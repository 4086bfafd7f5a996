pub mod binance;
pub mod error;
pub mod filters;
pub mod gateway;
pub mod paper;

pub use binance::{BinanceRestClient, MarketEvent, MarketPoller, MarketSnapshot};
pub use error::ExchangeError;
pub use filters::SymbolFilters;
pub use gateway::OrderGateway;
pub use paper::PaperGateway;
