use mockito::{Matcher, Server};
use perp_desk::exchange::binance::auth::get_timestamp;
use perp_desk::exchange::binance::retry::RetryPolicy;
use perp_desk::exchange::binance::Signer;
use perp_desk::{
    BinanceRestClient, Credentials, ExchangeError, KlineInterval, MarginType, MarketEvent, MarketPoller,
    OrderBook, OrderRequest, OrderStatus, RestSettings, Side,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> RestSettings {
    RestSettings {
        timeout: Duration::from_secs(5),
        recv_window_ms: Some(5000),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        },
    }
}

fn public_client(server: &Server) -> BinanceRestClient {
    BinanceRestClient::new(server.url(), None, settings()).unwrap()
}

fn signed_client(server: &Server) -> BinanceRestClient {
    let credentials = Credentials::new("test-key", Signer::hmac("test-secret"));
    BinanceRestClient::new(server.url(), Some(credentials), settings()).unwrap()
}

fn signed_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("recvWindow".into(), "5000".into()),
        Matcher::Regex(r"timestamp=\d{13}".into()),
        Matcher::Regex(r"signature=[0-9a-f]{64}$".into()),
    ])
}

const KLINES: &str = r#"[
    [1700000000000,"100.0","101.5","99.5","101.0","12.5",1700000059999,"1262.5",42,"6.0","606.0","0"],
    [1700000060000,"101.0","102.0","100.5","101.8","8.25",1700000119999,"839.85",31,"4.0","407.2","0"]
]"#;

const DEPTH: &str = r#"{
    "lastUpdateId": 1027024,
    "E": 1589436922972,
    "T": 1589436922959,
    "bids": [["101.70", "3.0"], ["101.60", "1.5"]],
    "asks": [["101.80", "1.0"], ["101.90", "2.5"]]
}"#;

const PREMIUM_INDEX: &str = r#"{
    "symbol": "BTCUSDT",
    "markPrice": "101.75000000",
    "indexPrice": "101.74000000",
    "lastFundingRate": "0.00010000",
    "nextFundingTime": 1700006400000,
    "time": 1700000100000
}"#;

const EXCHANGE_INFO: &str = r#"{
    "timezone": "UTC",
    "symbols": [
        {
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80", "maxPrice": "4529764"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "120"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"},
                {"filterType": "PERCENT_PRICE", "multiplierUp": "1.0500", "multiplierDown": "0.9500"}
            ]
        },
        {
            "symbol": "ETHUSDT",
            "status": "TRADING",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.01", "minPrice": "39.86", "maxPrice": "306177"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "10000"},
                {"filterType": "MIN_NOTIONAL", "notional": "20"}
            ]
        }
    ]
}"#;

const ORDER_FILLED: &str = r#"{
    "orderId": 4051,
    "symbol": "BTCUSDT",
    "status": "FILLED",
    "clientOrderId": "desk-test",
    "price": "0",
    "avgPrice": "101.80",
    "origQty": "0.010",
    "executedQty": "0.010",
    "stopPrice": "0",
    "timeInForce": "GTC",
    "type": "MARKET",
    "side": "BUY",
    "reduceOnly": false,
    "updateTime": 1700000100000
}"#;

#[tokio::test]
async fn test_ping_and_server_time() {
    let mut server = Server::new_async().await;
    let ping = server
        .mock("GET", "/fapi/v1/ping")
        .match_query(Matcher::Any)
        .with_body("{}")
        .create_async()
        .await;
    let time = server
        .mock("GET", "/fapi/v1/time")
        .match_query(Matcher::Any)
        .with_body(r#"{"serverTime": 1700000000000}"#)
        .create_async()
        .await;

    let client = public_client(&server);
    client.test_connectivity().await.unwrap();
    assert_eq!(client.get_server_time().await.unwrap(), 1_700_000_000_000);

    ping.assert_async().await;
    time.assert_async().await;
}

#[tokio::test]
async fn test_sync_time_measures_offset() {
    let mut server = Server::new_async().await;
    let ahead = get_timestamp() + 5_000;
    server
        .mock("GET", "/fapi/v1/time")
        .match_query(Matcher::Any)
        .with_body(format!(r#"{{"serverTime": {}}}"#, ahead))
        .create_async()
        .await;

    let client = public_client(&server);
    let offset = client.sync_time().await.unwrap();
    assert!((4_000..=5_000).contains(&offset), "offset {}", offset);
    assert_eq!(client.time_offset_ms(), offset);
}

#[tokio::test]
async fn test_klines_are_parsed() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v1/klines")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            Matcher::UrlEncoded("interval".into(), "1m".into()),
            Matcher::UrlEncoded("limit".into(), "2".into()),
        ]))
        .with_body(KLINES)
        .create_async()
        .await;

    let client = public_client(&server);
    let candles = client.get_klines("BTCUSDT", KlineInterval::OneMinute, 2).await.unwrap();

    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].open_time, 1_700_000_000_000);
    assert_eq!(candles[0].close, dec!(101.0));
    assert_eq!(candles[1].high, dec!(102.0));
    assert_eq!(candles[1].volume, dec!(8.25));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_depth_and_mark_price() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/depth")
        .match_query(Matcher::UrlEncoded("limit".into(), "20".into()))
        .with_body(DEPTH)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/premiumIndex")
        .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
        .with_body(PREMIUM_INDEX)
        .create_async()
        .await;

    let client = public_client(&server);
    let depth = client.get_order_book("BTCUSDT", 20).await.unwrap();
    assert_eq!(depth.last_update_id, 1_027_024);
    assert_eq!(depth.parse_bids().unwrap()[0], (dec!(101.7), dec!(3.0)));
    assert_eq!(depth.parse_asks().unwrap().len(), 2);

    assert_eq!(client.get_mark_price("BTCUSDT").await.unwrap(), dec!(101.75));
}

#[tokio::test]
async fn test_symbol_filters_are_cached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .match_query(Matcher::Any)
        .with_body(EXCHANGE_INFO)
        .expect(1)
        .create_async()
        .await;

    let client = public_client(&server);
    let btc = client.get_symbol_filters("BTCUSDT").await.unwrap();
    assert_eq!(btc.tick_size, dec!(0.1));
    assert_eq!(btc.step_size, dec!(0.001));
    assert_eq!(btc.max_qty, dec!(1000));
    assert_eq!(btc.min_notional, dec!(100));

    // Second symbol comes from the same response
    let eth = client.get_symbol_filters("ETHUSDT").await.unwrap();
    assert_eq!(eth.tick_size, dec!(0.01));
    assert_eq!(client.get_symbol_filters("BTCUSDT").await.unwrap(), btc);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_unknown_symbol() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/exchangeInfo")
        .match_query(Matcher::Any)
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;

    let client = public_client(&server);
    let err = client.get_symbol_filters("NOPEUSDT").await.unwrap_err();
    assert!(matches!(err, ExchangeError::UnknownSymbol(ref s) if s == "NOPEUSDT"));
}

#[tokio::test]
async fn test_signed_get_sends_key_and_signature() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v2/balance")
        .match_header("X-MBX-APIKEY", "test-key")
        .match_query(signed_query())
        .with_body(
            r#"[
                {"accountAlias": "x", "asset": "USDT", "balance": "1000.50", "crossWalletBalance": "1000.50",
                 "crossUnPnl": "-0.50", "availableBalance": "900.00", "maxWithdrawAmount": "900.00"},
                {"accountAlias": "x", "asset": "BNB", "balance": "0", "crossWalletBalance": "0",
                 "crossUnPnl": "0", "availableBalance": "0", "maxWithdrawAmount": "0"}
            ]"#,
        )
        .create_async()
        .await;

    let client = signed_client(&server);
    let balances = client.get_balances().await.unwrap();

    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].asset, "USDT");
    assert_eq!(balances[0].equity(), dec!(1000));
    assert_eq!(balances[0].available, dec!(900));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_positions_drop_flat_rows() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v2/positionRisk")
        .match_query(signed_query())
        .with_body(
            r#"[
                {"symbol": "BTCUSDT", "positionAmt": "-0.250", "entryPrice": "100.0", "markPrice": "98.0",
                 "unRealizedProfit": "0.50", "liquidationPrice": "140.1", "leverage": "5", "marginType": "cross"},
                {"symbol": "ETHUSDT", "positionAmt": "0.000", "entryPrice": "0.0", "markPrice": "2000.0",
                 "unRealizedProfit": "0.0", "liquidationPrice": "0", "leverage": "20", "marginType": "cross"}
            ]"#,
        )
        .create_async()
        .await;

    let client = signed_client(&server);
    let positions = client.get_positions().await.unwrap();

    assert_eq!(positions.len(), 1);
    let short = &positions[0];
    assert_eq!(short.side, Side::Sell);
    assert_eq!(short.quantity, dec!(0.25));
    assert_eq!(short.signed_quantity(), dec!(-0.25));
    assert_eq!(short.leverage, 5);
    assert_eq!(short.liquidation_price, Some(dec!(140.1)));
}

#[tokio::test]
async fn test_order_is_posted_as_form_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/fapi/v1/order")
        .match_header("X-MBX-APIKEY", "test-key")
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("symbol=BTCUSDT".into()),
            Matcher::Regex("side=BUY".into()),
            Matcher::Regex("type=MARKET".into()),
            Matcher::Regex("quantity=0.01&".into()),
            Matcher::Regex("newOrderRespType=RESULT".into()),
            Matcher::Regex(r"signature=[0-9a-f]{64}$".into()),
        ]))
        .with_body(ORDER_FILLED)
        .create_async()
        .await;

    let client = signed_client(&server);
    let order = client
        .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, dec!(0.010)))
        .await
        .unwrap();

    assert_eq!(order.order_id, 4051);
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.fill_price(), dec!(101.8));
    assert_eq!(order.executed_qty, dec!(0.01));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_api_error_is_mapped() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/fapi/v1/order")
        .with_status(400)
        .with_body(r#"{"code": -2019, "msg": "Margin is insufficient."}"#)
        .create_async()
        .await;

    let client = signed_client(&server);
    let err = client
        .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, dec!(5)))
        .await
        .unwrap_err();

    match err {
        ExchangeError::Api { status, code, msg } => {
            assert_eq!(status, 400);
            assert_eq!(code, -2019);
            assert_eq!(msg, "Margin is insufficient.");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_errors_are_retried_for_get() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/fapi/v1/premiumIndex")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("Service Unavailable")
        .expect(3)
        .create_async()
        .await;

    let client = public_client(&server);
    let err = client.get_mark_price("BTCUSDT").await.unwrap_err();

    assert!(matches!(err, ExchangeError::Http { status: 503, .. }));
    assert_eq!(client.metrics().request_count("/fapi/v1/premiumIndex", "error"), 3);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_orders_are_never_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/fapi/v1/order")
        .with_status(503)
        .with_body(r#"{"code": -1001, "msg": "Internal error; unable to process your request."}"#)
        .expect(1)
        .create_async()
        .await;

    let client = signed_client(&server);
    let err = client
        .place_order(&OrderRequest::market("BTCUSDT", Side::Sell, dec!(0.01)))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.api_code(), Some(-1001));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/fapi/v1/order")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code": -2011, "msg": "Unknown order sent."}"#)
        .expect(1)
        .create_async()
        .await;

    let client = signed_client(&server);
    let err = client.cancel_order("BTCUSDT", 99).await.unwrap_err();
    assert_eq!(err.api_code(), Some(-2011));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_cancel_order() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/fapi/v1/order")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            Matcher::UrlEncoded("orderId".into(), "4051".into()),
        ]))
        .with_body(ORDER_FILLED.replace("FILLED", "CANCELED"))
        .create_async()
        .await;

    let client = signed_client(&server);
    let order = client.cancel_order("BTCUSDT", 4051).await.unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn test_leverage_and_margin_type() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/fapi/v1/leverage")
        .match_body(Matcher::Regex("leverage=5".into()))
        .with_body(r#"{"leverage": 5, "maxNotionalValue": "1000000", "symbol": "BTCUSDT"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/fapi/v1/marginType")
        .match_body(Matcher::Regex("marginType=ISOLATED".into()))
        .with_status(400)
        .with_body(r#"{"code": -4046, "msg": "No need to change margin type."}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/fapi/v1/marginType")
        .match_body(Matcher::Regex("marginType=CROSSED".into()))
        .with_status(400)
        .with_body(r#"{"code": -4047, "msg": "Margin type cannot be changed if there exists open orders."}"#)
        .create_async()
        .await;

    let client = signed_client(&server);
    assert_eq!(client.set_leverage("BTCUSDT", 5).await.unwrap(), 5);
    client.set_margin_type("BTCUSDT", MarginType::Isolated).await.unwrap();

    let err = client.set_margin_type("BTCUSDT", MarginType::Crossed).await.unwrap_err();
    assert_eq!(err.api_code(), Some(-4047));
}

#[tokio::test]
async fn test_signed_calls_need_credentials() {
    let server = Server::new_async().await;
    let client = public_client(&server);

    let err = client.get_positions().await.unwrap_err();
    assert!(matches!(err, ExchangeError::Credentials(_)));

    let err = client
        .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Credentials(_)));
}

#[tokio::test]
async fn test_poller_round_updates_book() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/fapi/v1/depth")
        .match_query(Matcher::Any)
        .with_body(DEPTH)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/klines")
        .match_query(Matcher::Any)
        .with_body(KLINES)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/premiumIndex")
        .match_query(Matcher::Any)
        .with_body(PREMIUM_INDEX)
        .create_async()
        .await;

    let client = Arc::new(public_client(&server));
    let book = Arc::new(OrderBook::new("BTCUSDT"));
    let (poller, _events) = MarketPoller::new(
        client,
        "BTCUSDT".to_string(),
        KlineInterval::OneMinute,
        2,
        20,
        Duration::from_millis(10),
        Arc::clone(&book),
    );

    let snapshot = poller.poll_once().await.unwrap();
    assert_eq!(snapshot.book_update_id, 1_027_024);
    assert_eq!(snapshot.mark_price, dec!(101.75));
    assert_eq!(snapshot.candles.len(), 2);

    assert_eq!(book.last_update_id(), 1_027_024);
    assert_eq!(book.best_bid().unwrap().price, dec!(101.7));
    assert_eq!(book.best_ask().unwrap().price, dec!(101.8));
    assert_eq!(book.get_book_depth_count(), (2, 2));
}

#[tokio::test]
async fn test_poller_reports_outage_from_first_round() {
    let mut server = Server::new_async().await;
    let broken_depth = server
        .mock("GET", "/fapi/v1/depth")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/klines")
        .match_query(Matcher::Any)
        .with_body(KLINES)
        .create_async()
        .await;
    server
        .mock("GET", "/fapi/v1/premiumIndex")
        .match_query(Matcher::Any)
        .with_body(PREMIUM_INDEX)
        .create_async()
        .await;

    let client = Arc::new(public_client(&server));
    let book = Arc::new(OrderBook::new("BTCUSDT"));
    let (poller, mut events) = MarketPoller::new(
        client,
        "BTCUSDT".to_string(),
        KlineInterval::OneMinute,
        2,
        20,
        Duration::from_millis(10),
        Arc::clone(&book),
    );
    let poller = poller.with_backoff(Duration::from_millis(20), Duration::from_millis(50));
    let task = tokio::spawn(async move { poller.run().await });

    let wait = Duration::from_secs(5);
    let first = tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, MarketEvent::Disconnected));

    broken_depth.remove_async().await;
    server
        .mock("GET", "/fapi/v1/depth")
        .match_query(Matcher::Any)
        .with_body(DEPTH)
        .create_async()
        .await;

    let next = tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap();
    assert!(matches!(next, MarketEvent::Connected));
    let next = tokio::time::timeout(wait, events.recv()).await.unwrap().unwrap();
    match next {
        MarketEvent::Snapshot(snapshot) => assert_eq!(snapshot.book_update_id, 1_027_024),
        other => panic!("expected snapshot, got {:?}", other),
    }

    task.abort();
}
