pub mod types;
pub mod orderbook;

pub use types::*;
pub use orderbook::{OrderBook, PriceLevel};
