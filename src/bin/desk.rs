use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use perp_desk::data::closes;
use perp_desk::strategy::indicators::{bollinger, ema, rsi, sma};
use perp_desk::{
    BinanceRestClient, Config, Credentials, EngineSettings, ExecutionEngine, KlineInterval, MarginType, OrderBook,
    OrderGateway, OrderRequest, RiskManager, Side,
};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;

/// Manual desk for Binance USDⓈ-M futures
#[derive(Parser, Debug)]
#[command(name = "desk", version, about)]
struct Cli {
    /// Config file (defaults to CONFIG_FILE or config/desk.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wallet balances
    Balance,
    /// Open positions
    Positions,
    /// Open orders
    Orders {
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Top of the order book
    Book {
        symbol: String,
        #[arg(long, default_value_t = 10)]
        depth: usize,
    },
    /// RSI, Bollinger bands and book imbalance
    Indicators {
        symbol: String,
        #[arg(long, default_value = "1m")]
        interval: KlineInterval,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Buy by quantity or USD notional
    Buy(OrderArgs),
    /// Sell by quantity or USD notional
    Sell(OrderArgs),
    /// Cancel one order
    Cancel { symbol: String, order_id: u64 },
    /// Cancel every open order for a symbol
    CancelAll { symbol: String },
    /// Reduce-only market close of a position
    Close { symbol: String },
    /// Cancel all orders and close all positions
    Flatten {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Move a position to a signed target quantity (negative = short)
    Target {
        symbol: String,
        #[arg(allow_negative_numbers = true)]
        quantity: Decimal,
    },
    /// Attach stop-loss and take-profit triggers to a position
    Brackets {
        symbol: String,
        #[arg(long)]
        sl_bps: Option<Decimal>,
        #[arg(long)]
        tp_bps: Option<Decimal>,
    },
    /// Set leverage for a symbol
    Leverage { symbol: String, leverage: u32 },
    /// Switch between ISOLATED and CROSSED margin
    MarginType { symbol: String, margin_type: MarginType },
    /// Compare local and server clocks
    Time,
}

#[derive(Args, Debug)]
struct OrderArgs {
    symbol: String,

    /// Quantity in base units
    #[arg(long, required_unless_present = "usd", conflicts_with = "usd")]
    qty: Option<Decimal>,

    /// Notional in USD, converted at the limit or mark price
    #[arg(long)]
    usd: Option<Decimal>,

    /// Limit price; market order when omitted
    #[arg(long)]
    price: Option<Decimal>,

    #[arg(long)]
    reduce_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    perp_desk::utils::init_cli_logger(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    // Public commands still work without keys
    let credentials = Credentials::from_env(config.exchange.key_type).ok();
    let client = Arc::new(BinanceRestClient::new(
        config.exchange.api_endpoint.clone(),
        credentials,
        config.rest_settings(),
    )?);
    if client.has_credentials() {
        if let Err(e) = client.sync_time().await {
            tracing::warn!("Clock sync failed: {}", e);
        }
    }

    match cli.command {
        Command::Balance => {
            for b in client.get_balances().await? {
                println!(
                    "{:<6} wallet {:>14} upnl {:>12} available {:>14} equity {:>14}",
                    b.asset,
                    b.wallet_balance,
                    b.unrealized_pnl,
                    b.available,
                    b.equity()
                );
            }
        }
        Command::Positions => {
            let positions = client.get_positions().await?;
            if positions.is_empty() {
                println!("No open positions");
            }
            for p in positions {
                let liq = p
                    .liquidation_distance_pct()
                    .map(|d| format!("{}%", d.round_dp(2)))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<12} {:<4} qty {:>12} entry {:>12} mark {:>12} upnl {:>10} {}x liq-dist {}",
                    p.symbol,
                    if p.side == Side::Buy { "LONG" } else { "SHORT" },
                    p.quantity,
                    p.entry_price,
                    p.mark_price,
                    p.unrealized_pnl.round_dp(4),
                    p.leverage,
                    liq
                );
            }
        }
        Command::Orders { symbol } => {
            let symbol = symbol.map(|s| s.to_uppercase());
            let orders = client.get_open_orders(symbol.as_deref()).await?;
            if orders.is_empty() {
                println!("No open orders");
            }
            for o in orders {
                println!(
                    "{:<12} #{:<12} {:<4} {:<20} qty {:>10} price {:>12} stop {:>12} {:?}{}",
                    o.symbol,
                    o.order_id,
                    o.side,
                    o.order_type,
                    o.orig_qty,
                    o.price,
                    o.stop_price,
                    o.status,
                    if o.reduce_only { " reduce-only" } else { "" }
                );
            }
        }
        Command::Book { symbol, depth } => {
            let symbol = symbol.to_uppercase();
            let snapshot = client.get_order_book(&symbol, book_limit(depth)).await?;
            let book = OrderBook::new(&symbol);
            book.apply_snapshot(snapshot.last_update_id, &snapshot.parse_bids()?, &snapshot.parse_asks()?)?;

            let asks = book.top_levels(Side::Sell, depth);
            for level in asks.iter().rev() {
                println!("        {:>14} {:>14}", level.price, level.quantity);
            }
            println!(
                "  ---- mid {:?} spread {:?} bps",
                book.get_mid_price(),
                book.get_spread_bps().map(|s| s.round_dp(2))
            );
            for level in book.top_levels(Side::Buy, depth) {
                println!("{:>14} {:>14}", level.quantity, level.price);
            }
        }
        Command::Indicators { symbol, interval, limit } => {
            let symbol = symbol.to_uppercase();
            let candles = client.get_klines(&symbol, interval, limit).await?;
            let series = closes(&candles);
            let s = &config.strategy;

            println!("{} {} x{} last close {:?}", symbol, interval, series.len(), series.last());
            println!("SMA({})  {:?}", s.bollinger_period, sma(&series, s.bollinger_period));
            println!("EMA({})  {:?}", s.bollinger_period, ema(&series, s.bollinger_period));
            println!("RSI({})  {:?}", s.rsi_period, rsi(&series, s.rsi_period));
            match (bollinger(&series, s.bollinger_period, s.bollinger_k), series.last()) {
                (Some(bands), Some(&last)) => println!(
                    "BB({}, {})  lower {:.4} middle {:.4} upper {:.4} %b {:?} z {:?} width {:.4}",
                    s.bollinger_period,
                    s.bollinger_k,
                    bands.lower,
                    bands.middle,
                    bands.upper,
                    bands.percent_b(last),
                    bands.z_score(last),
                    bands.bandwidth()
                ),
                _ => println!("BB: not enough data"),
            }

            let snapshot = client.get_order_book(&symbol, book_limit(s.imbalance_levels)).await?;
            let book = OrderBook::new(&symbol);
            book.apply_snapshot(snapshot.last_update_id, &snapshot.parse_bids()?, &snapshot.parse_asks()?)?;
            println!(
                "Imbalance({})  ratio {:?} normalized {:?}",
                s.imbalance_levels,
                book.calculate_imbalance(s.imbalance_levels),
                book.normalized_imbalance(s.imbalance_levels)
            );
        }
        Command::Buy(args) => place(&client, &config, Side::Buy, args).await?,
        Command::Sell(args) => place(&client, &config, Side::Sell, args).await?,
        Command::Cancel { symbol, order_id } => {
            let order = client.cancel_order(&symbol.to_uppercase(), order_id).await?;
            println!("Cancelled #{} ({:?})", order.order_id, order.status);
        }
        Command::CancelAll { symbol } => {
            client.cancel_all_orders(&symbol.to_uppercase()).await?;
            println!("Cancelled all open orders on {}", symbol.to_uppercase());
        }
        Command::Close { symbol } => {
            let mut engine = build_engine(&client, &config, config.engine_settings());
            match engine.close_position(&symbol.to_uppercase()).await? {
                Some(pnl) => println!("Closed {} realized {}", symbol.to_uppercase(), pnl.round_dp(4)),
                None => println!("No position in {}", symbol.to_uppercase()),
            }
        }
        Command::Flatten { yes } => {
            if !yes {
                bail!("flatten cancels every order and closes every position; re-run with --yes");
            }
            let mut engine = build_engine(&client, &config, config.engine_settings());
            let report = engine.flatten_all().await?;
            for symbol in &report.cancelled {
                println!("Cancelled orders on {}", symbol);
            }
            for (symbol, pnl) in &report.closed {
                println!("Closed {} realized {}", symbol, pnl.round_dp(4));
            }
            for (symbol, reason) in &report.failures {
                eprintln!("FAILED {}: {}", symbol, reason);
            }
            if !report.is_clean() {
                bail!("{} symbol(s) failed to flatten", report.failures.len());
            }
        }
        Command::Target { symbol, quantity } => {
            let mut engine = build_engine(&client, &config, config.engine_settings());
            let orders = engine.rebalance_to(&symbol.to_uppercase(), quantity).await?;
            if orders.is_empty() {
                println!("Already at target");
            }
            for o in orders {
                println!(
                    "#{} {} {} @ {} {:?}",
                    o.order_id,
                    o.side,
                    o.executed_qty,
                    o.fill_price(),
                    o.status
                );
            }
        }
        Command::Brackets { symbol, sl_bps, tp_bps } => {
            let mut settings = config.engine_settings();
            if let Some(sl) = sl_bps {
                settings.stop_loss_bps = sl;
            }
            if let Some(tp) = tp_bps {
                settings.take_profit_bps = tp;
            }
            let mut engine = build_engine(&client, &config, settings);
            let (stop, take_profit) = engine.place_brackets(&symbol.to_uppercase()).await?;
            println!("Stop #{} at {}", stop.order_id, stop.stop_price);
            println!("Take profit #{} at {}", take_profit.order_id, take_profit.stop_price);
        }
        Command::Leverage { symbol, leverage } => {
            if leverage > config.risk.max_leverage {
                bail!("leverage {}x above configured max {}x", leverage, config.risk.max_leverage);
            }
            let set = client.set_leverage(&symbol.to_uppercase(), leverage).await?;
            println!("{} leverage {}x", symbol.to_uppercase(), set);
        }
        Command::MarginType { symbol, margin_type } => {
            client.set_margin_type(&symbol.to_uppercase(), margin_type).await?;
            println!("{} margin {}", symbol.to_uppercase(), margin_type.as_str());
        }
        Command::Time => {
            let server = client.get_server_time().await?;
            let offset = client.sync_time().await?;
            println!("server {} offset {}ms", server, offset);
        }
    }

    Ok(())
}

fn build_engine(
    client: &Arc<BinanceRestClient>,
    config: &Config,
    settings: EngineSettings,
) -> ExecutionEngine<BinanceRestClient> {
    let risk = RiskManager::new(config.risk_limits(), config.risk.initial_equity_usd);
    ExecutionEngine::new(Arc::clone(client), risk, settings)
}

/// Smallest valid depth limit covering `levels`
fn book_limit(levels: usize) -> u32 {
    [5u32, 10, 20, 50, 100, 500, 1000]
        .into_iter()
        .find(|l| *l as usize >= levels)
        .unwrap_or(1000)
}

async fn place(client: &Arc<BinanceRestClient>, config: &Config, side: Side, args: OrderArgs) -> Result<()> {
    let symbol = args.symbol.to_uppercase();
    let reference = match args.price {
        Some(price) => price,
        None => client.mark_price(&symbol).await?,
    };

    let quantity = match (args.qty, args.usd) {
        (Some(qty), _) => qty,
        (None, Some(usd)) => usd / reference,
        (None, None) => bail!("either --qty or --usd is required"),
    };

    let mut request = match args.price {
        Some(price) => OrderRequest::limit(&symbol, side, price, quantity),
        None => OrderRequest::market(&symbol, side, quantity),
    };
    if args.reduce_only {
        request = request.reduce_only();
    }

    let mut engine = build_engine(client, config, config.engine_settings());
    let order = engine
        .submit(request, reference)
        .await
        .with_context(|| format!("{} {} failed", side, symbol))?;

    println!(
        "#{} {} {} {} qty {} filled {} @ {} {:?}",
        order.order_id,
        order.symbol,
        order.side,
        order.order_type,
        order.orig_qty,
        order.executed_qty,
        order.fill_price(),
        order.status
    );
    Ok(())
}
