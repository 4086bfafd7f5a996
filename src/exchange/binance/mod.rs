pub mod auth;
pub mod poller;
pub mod rest;
pub mod retry;
pub mod types;

pub use auth::{Credentials, KeyType, Signer};
pub use poller::{MarketEvent, MarketPoller, MarketSnapshot};
pub use rest::{BinanceRestClient, RestSettings};
pub use types::MarginType;
