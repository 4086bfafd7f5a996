use anyhow::{Context, Result};
use clap::Parser;
use perp_desk::data::closes;
use perp_desk::{
    BinanceRestClient, BollingerSignal, Config, Credentials, ExecutionEngine, ImbalanceDetector, MarketEvent,
    MarketPoller, MarketSnapshot, OrderBook, OrderGateway, PaperGateway, RiskManager, RiskViolation, RsiSignal,
    Signal, SignalAggregator, TradingStats, ViolationSeverity,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Polling signal trader
#[derive(Parser, Debug)]
#[command(name = "auto_trader", version, about)]
struct Cli {
    /// Simulate fills locally; market data is still live
    #[arg(long)]
    paper: bool,

    /// Cancel orders and close positions on Ctrl-C
    #[arg(long)]
    flatten_on_exit: bool,

    /// Config file (defaults to CONFIG_FILE or config/desk.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured symbol
    #[arg(long)]
    symbol: Option<String>,
}

/// Imbalance, RSI and Bollinger generators feeding one aggregator
struct SignalStack {
    imbalance: ImbalanceDetector,
    rsi: RsiSignal,
    bollinger: BollingerSignal,
    aggregator: SignalAggregator,
}

impl SignalStack {
    fn from_config(config: &Config) -> Self {
        let s = &config.strategy;
        Self {
            imbalance: ImbalanceDetector::new(s.imbalance_levels, s.imbalance_window, s.imbalance_threshold),
            rsi: RsiSignal::new(s.rsi_period, s.rsi_oversold, s.rsi_overbought),
            bollinger: BollingerSignal::new(s.bollinger_period, s.bollinger_k),
            aggregator: SignalAggregator::new(s.primary_threshold, s.confirming_threshold, s.min_confirming_signals),
        }
    }

    fn evaluate(&mut self, orderbook: &OrderBook, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let series = closes(&snapshot.candles);

        [
            self.imbalance.calculate_signal(orderbook),
            self.rsi.evaluate(&series),
            self.bollinger.evaluate(&series),
        ]
        .into_iter()
        .flatten()
        .inspect(|s| {
            debug!(
                source = s.source,
                side = %s.direction,
                strength = s.strength,
                confidence = s.confidence,
                "Signal"
            )
        })
        .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(symbol) = &cli.symbol {
        config.general.symbol = symbol.to_uppercase();
    }
    perp_desk::utils::init_from_config(&config.logging)?;

    let mode = if cli.paper { "PAPER" } else { "LIVE" };
    info!(
        mode,
        symbol = %config.general.symbol,
        environment = %config.general.environment,
        endpoint = %config.exchange.api_endpoint,
        "Starting auto trader"
    );
    if !cli.paper {
        warn!("LIVE mode: orders are sent to the exchange");
    }

    let credentials = match Credentials::from_env(config.exchange.key_type) {
        Ok(creds) => Some(creds),
        Err(e) if cli.paper => {
            info!("No credentials ({}); paper mode uses public data only", e);
            None
        }
        Err(e) => return Err(e).context("live trading needs API credentials"),
    };

    let client = Arc::new(BinanceRestClient::new(
        config.exchange.api_endpoint.clone(),
        credentials,
        config.rest_settings(),
    )?);
    client.test_connectivity().await.context("exchange unreachable")?;
    if client.has_credentials() {
        let offset = client.sync_time().await?;
        info!(offset_ms = offset, "Clock synced");
    }

    let symbol = config.general.symbol.clone();
    let filters = client.get_symbol_filters(&symbol).await?;
    info!(
        tick = %filters.tick_size,
        step = %filters.step_size,
        min_notional = %filters.min_notional,
        "Symbol filters loaded"
    );

    if cli.paper {
        let paper = Arc::new(PaperGateway::new(config.paper.slippage_bps));
        paper.register_symbol(filters, client.get_mark_price(&symbol).await?);

        let risk = RiskManager::new(config.risk_limits(), config.risk.initial_equity_usd);
        let engine = ExecutionEngine::new(Arc::clone(&paper), risk, config.engine_settings());
        run(engine, client, Some(paper), &config, cli.flatten_on_exit).await
    } else {
        let leverage = client.set_leverage(&symbol, config.position_sizing.leverage).await?;
        let equity = account_equity(&client)
            .await
            .unwrap_or(config.risk.initial_equity_usd);
        info!(leverage, %equity, "Account ready");

        let risk = RiskManager::new(config.risk_limits(), equity);
        let engine = ExecutionEngine::new(Arc::clone(&client), risk, config.engine_settings());
        run(engine, client, None, &config, cli.flatten_on_exit).await
    }
}

/// USDT wallet equity, or None when unavailable
async fn account_equity(client: &BinanceRestClient) -> Option<Decimal> {
    match client.get_balances().await {
        Ok(balances) => balances.iter().find(|b| b.asset == "USDT").map(|b| b.equity()),
        Err(e) => {
            warn!("Balance fetch failed: {}", e);
            None
        }
    }
}

async fn run<G: OrderGateway + 'static>(
    mut engine: ExecutionEngine<G>,
    client: Arc<BinanceRestClient>,
    paper: Option<Arc<PaperGateway>>,
    config: &Config,
    flatten_on_exit: bool,
) -> Result<()> {
    let symbol = config.general.symbol.clone();
    let orderbook = Arc::new(OrderBook::new(&symbol));

    let (poller, mut event_rx) = MarketPoller::new(
        Arc::clone(&client),
        symbol.clone(),
        config.strategy.kline_interval,
        config.strategy.kline_limit,
        config.strategy.depth_limit,
        config.poll_interval(),
        Arc::clone(&orderbook),
    );
    let poller_task = tokio::spawn(async move { poller.run().await });

    engine.refresh_positions().await?;
    let mut signals = SignalStack::from_config(config);
    let min_confirming = config.strategy.min_confirming_signals;

    let mut report = tokio::time::interval(Duration::from_secs(config.metrics.report_interval_secs.max(1)));
    report.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("System ready. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            _ = report.tick() => log_stats(&engine.get_stats()),
            event = event_rx.recv() => match event {
                Some(MarketEvent::Connected) => info!("Market data connected"),
                Some(MarketEvent::Disconnected) => warn!("Market data disconnected"),
                Some(MarketEvent::Snapshot(snapshot)) => {
                    if let Some(paper) = &paper {
                        for fill in paper.set_mark(&snapshot.symbol, snapshot.mark_price) {
                            info!(order_id = fill.order_id, kind = %fill.order_type, price = %fill.fill_price(), "Paper trigger filled");
                        }
                    }
                    on_snapshot(&mut engine, &mut signals, &orderbook, &snapshot, min_confirming).await;
                }
                None => {
                    warn!("Market data channel closed");
                    break;
                }
            }
        }
    }

    poller_task.abort();

    if flatten_on_exit {
        let report = engine.flatten_all().await?;
        info!(
            cancelled = report.cancelled.len(),
            closed = report.closed.len(),
            failures = report.failures.len(),
            "Flattened on exit"
        );
    }

    log_stats(&engine.get_stats());
    if config.metrics.enabled {
        match client.metrics().render() {
            Ok(text) => info!("Metrics:\n{}", text),
            Err(e) => warn!("Metrics render failed: {}", e),
        }
    }
    Ok(())
}

async fn on_snapshot<G: OrderGateway>(
    engine: &mut ExecutionEngine<G>,
    signals: &mut SignalStack,
    orderbook: &OrderBook,
    snapshot: &MarketSnapshot,
    min_confirming: usize,
) {
    if let Err(e) = engine.refresh_positions().await {
        warn!("Position refresh failed: {}", e);
    }

    let marks = HashMap::from([(snapshot.symbol.clone(), snapshot.mark_price)]);
    match engine.check_exits(&marks).await {
        Ok(closed) => {
            for (symbol, pnl) in closed {
                info!(symbol = %symbol, pnl = %pnl, "Exit taken");
            }
        }
        Err(e) => error!("Error checking exits: {}", e),
    }

    let evaluated = signals.evaluate(orderbook, snapshot);
    let Some(composite) = signals.aggregator.aggregate(evaluated) else {
        return;
    };
    if !composite.is_tradeable(min_confirming) {
        debug!(confidence = composite.confidence, "Composite below trade threshold");
        return;
    }

    info!(
        side = %composite.direction,
        strength = composite.overall_strength,
        confidence = composite.confidence,
        sources = ?composite.sources(),
        "Composite signal"
    );

    if engine.risk_manager().is_halted() {
        warn!(
            "Trading halted: {}",
            engine.risk_manager().halt_reason().unwrap_or("Unknown")
        );
        return;
    }
    if engine.positions().get_position(&snapshot.symbol).is_some() {
        debug!("Already positioned in {}", snapshot.symbol);
        return;
    }

    match engine
        .execute_signal(&snapshot.symbol, &composite, snapshot.mark_price)
        .await
    {
        Ok(result) => info!(
            order_id = result.order_id,
            price = %result.executed_price,
            qty = %result.executed_qty,
            latency_ms = result.latency_ms,
            "Trade executed"
        ),
        Err(e) => {
            error!("Execution failed: {}", e);
            let emergency = e
                .downcast_ref::<RiskViolation>()
                .map_or(false, |v| v.severity == ViolationSeverity::Emergency);
            if emergency {
                if let Err(e) = engine.emergency_close_all().await {
                    error!("Emergency close failed: {}", e);
                }
            }
        }
    }
}

fn log_stats(stats: &TradingStats) {
    info!(
        open = stats.open_positions,
        closed = stats.closed_trades,
        realized = %stats.total_realized_pnl,
        fees = %stats.total_fees,
        win_rate = %format!("{:.1}%", stats.win_rate * 100.0),
        daily_pnl = %stats.risk_metrics.daily_pnl,
        drawdown = %stats.risk_metrics.drawdown_percent.round_dp(2),
        halted = stats.risk_metrics.trading_halted,
        "Trading stats"
    );
}
