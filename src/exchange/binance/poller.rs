use crate::data::{Candle, KlineInterval, OrderBook};
use crate::exchange::binance::rest::BinanceRestClient;
use crate::exchange::error::ExchangeError;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// One polling round for a symbol
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub mark_price: Decimal,
    pub book_update_id: u64,
}

/// Events emitted by the polling loop
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Snapshot(MarketSnapshot),
    Connected,
    Disconnected,
}

/// Polls depth, klines and mark price on a fixed cadence
pub struct MarketPoller {
    client: Arc<BinanceRestClient>,
    symbol: String,
    interval: KlineInterval,
    kline_limit: u32,
    depth_limit: u32,
    poll_interval: Duration,
    orderbook: Arc<OrderBook>,
    initial_backoff: Duration,
    max_backoff: Duration,
    event_tx: mpsc::UnboundedSender<MarketEvent>,
}

impl MarketPoller {
    pub fn new(
        client: Arc<BinanceRestClient>,
        symbol: String,
        interval: KlineInterval,
        kline_limit: u32,
        depth_limit: u32,
        poll_interval: Duration,
        orderbook: Arc<OrderBook>,
    ) -> (Self, mpsc::UnboundedReceiver<MarketEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                client,
                symbol,
                interval,
                kline_limit,
                depth_limit,
                poll_interval,
                orderbook,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                event_tx,
            },
            event_rx,
        )
    }

    /// Override the 1s..60s error backoff
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Fetch one round and apply the depth snapshot to the shared book
    pub async fn poll_once(&self) -> Result<MarketSnapshot, ExchangeError> {
        let (depth, candles, mark_price) = tokio::try_join!(
            self.client.get_order_book(&self.symbol, self.depth_limit),
            self.client.get_klines(&self.symbol, self.interval, self.kline_limit),
            self.client.get_mark_price(&self.symbol),
        )?;

        self.orderbook
            .apply_snapshot(depth.last_update_id, &depth.parse_bids()?, &depth.parse_asks()?)
            .map_err(|e| ExchangeError::Malformed(format!("depth snapshot: {}", e)))?;

        Ok(MarketSnapshot {
            symbol: self.symbol.clone(),
            candles,
            mark_price,
            book_update_id: depth.last_update_id,
        })
    }

    /// Poll until the receiver is dropped
    ///
    /// Errors back off exponentially from 1s to 60s. Connected and
    /// Disconnected fire on every state change, including a first round
    /// that fails.
    pub async fn run(&self) {
        let mut retry_delay = self.initial_backoff;
        // None until the first round completes
        let mut connected: Option<bool> = None;

        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            poll_ms = self.poll_interval.as_millis() as u64,
            "Starting market poller"
        );

        loop {
            match self.poll_once().await {
                Ok(snapshot) => {
                    if connected != Some(true) {
                        connected = Some(true);
                        info!(symbol = %self.symbol, "Market data connected");
                        if self.event_tx.send(MarketEvent::Connected).is_err() {
                            break;
                        }
                    }
                    retry_delay = self.initial_backoff;

                    debug!(
                        symbol = %snapshot.symbol,
                        update_id = snapshot.book_update_id,
                        mark = %snapshot.mark_price,
                        "Snapshot"
                    );
                    if self.event_tx.send(MarketEvent::Snapshot(snapshot)).is_err() {
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!("Market poll failed: {}. Retrying in {:?}", e, retry_delay);

                    if connected != Some(false) {
                        connected = Some(false);
                        if self.event_tx.send(MarketEvent::Disconnected).is_err() {
                            break;
                        }
                    }

                    tokio::time::sleep(retry_delay).await;
                    retry_delay = std::cmp::min(retry_delay * 2, self.max_backoff);
                }
            }
        }

        info!(symbol = %self.symbol, "Market poller stopped");
    }
}
