use crate::data::KlineInterval;
use crate::exchange::binance::auth::KeyType;
use crate::exchange::binance::retry::RetryPolicy;
use crate::exchange::binance::RestSettings;
use crate::risk::RiskLimits;
use crate::strategy::EngineSettings;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
///
/// Credentials never live here; they come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub position_sizing: PositionSizingConfig,
    pub risk: RiskConfig,
    pub paper: PaperConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub symbol: String,
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            environment: "testnet".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_endpoint: String,
    pub key_type: KeyType,
    pub recv_window_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://testnet.binancefuture.com".into(),
            key_type: KeyType::Hmac,
            recv_window_ms: 5000,
            request_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub kline_interval: KlineInterval,
    pub kline_limit: u32,
    pub depth_limit: u32,
    pub poll_interval_ms: u64,

    pub imbalance_levels: usize,
    pub imbalance_window: usize,
    pub imbalance_threshold: f64,

    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,

    pub bollinger_period: usize,
    pub bollinger_k: f64,

    pub primary_threshold: f64,
    pub confirming_threshold: f64,
    pub min_confirming_signals: usize,

    pub take_profit_bps: Decimal,
    pub stop_loss_bps: Decimal,
    pub max_hold_time_ms: u64,
    pub attach_brackets: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kline_interval: KlineInterval::OneMinute,
            kline_limit: 100,
            depth_limit: 20,
            poll_interval_ms: 2000,
            imbalance_levels: 10,
            imbalance_window: 60,
            imbalance_threshold: 2.5,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bollinger_period: 20,
            bollinger_k: 2.0,
            primary_threshold: 2.0,
            confirming_threshold: 1.0,
            min_confirming_signals: 1,
            take_profit_bps: Decimal::from(30),
            stop_loss_bps: Decimal::from(20),
            max_hold_time_ms: 3_600_000,
            attach_brackets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSizingConfig {
    pub base_notional_usd: Decimal,
    pub min_size_multiplier: Decimal,
    pub max_size_multiplier: Decimal,
    pub leverage: u32,
    pub taker_fee_rate: Decimal,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            base_notional_usd: engine.base_position_size,
            min_size_multiplier: engine.min_size_multiplier,
            max_size_multiplier: engine.max_size_multiplier,
            leverage: engine.leverage,
            taker_fee_rate: engine.taker_fee_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_position_usd: Decimal,
    pub max_portfolio_exposure_usd: Decimal,
    pub max_leverage: u32,
    pub max_daily_loss_usd: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_trades_per_hour: usize,
    pub max_trades_per_day: usize,
    pub max_acceptable_latency_ms: u64,
    /// Equity baseline for drawdown when the balance cannot be fetched
    pub initial_equity_usd: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let limits = RiskLimits::default();
        Self {
            max_position_usd: limits.max_position_notional,
            max_portfolio_exposure_usd: limits.max_portfolio_exposure,
            max_leverage: limits.max_leverage,
            max_daily_loss_usd: limits.max_daily_loss,
            max_drawdown_pct: limits.max_drawdown_percent,
            max_trades_per_hour: limits.max_trades_per_hour,
            max_trades_per_day: limits.max_trades_per_day,
            max_acceptable_latency_ms: limits.max_acceptable_latency_ms,
            initial_equity_usd: Decimal::from(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub slippage_bps: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            slippage_bps: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            output: "pretty".into(),
            file_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Seconds between stats lines in the trading loop
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load a TOML file, then apply `DESK__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("DESK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `CONFIG_FILE` or the default path
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config/desk.toml".to_string());
        Self::from_file(path)
    }

    /// Parse TOML text without environment overrides
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.symbol.trim().is_empty() {
            bail!("general.symbol must be set");
        }
        if self.position_sizing.min_size_multiplier > self.position_sizing.max_size_multiplier {
            bail!("position_sizing.min_size_multiplier exceeds max_size_multiplier");
        }
        if self.position_sizing.leverage == 0 || self.position_sizing.leverage > self.risk.max_leverage {
            bail!(
                "position_sizing.leverage {} outside 1..={}",
                self.position_sizing.leverage,
                self.risk.max_leverage
            );
        }
        if self.strategy.rsi_oversold >= self.strategy.rsi_overbought {
            bail!("strategy.rsi_oversold must be below rsi_overbought");
        }
        if self.strategy.poll_interval_ms == 0 {
            bail!("strategy.poll_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_position_notional: self.risk.max_position_usd,
            max_portfolio_exposure: self.risk.max_portfolio_exposure_usd,
            max_leverage: self.risk.max_leverage,
            max_daily_loss: self.risk.max_daily_loss_usd,
            max_drawdown_percent: self.risk.max_drawdown_pct,
            max_trades_per_hour: self.risk.max_trades_per_hour,
            max_trades_per_day: self.risk.max_trades_per_day,
            max_acceptable_latency_ms: self.risk.max_acceptable_latency_ms,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            base_position_size: self.position_sizing.base_notional_usd,
            min_size_multiplier: self.position_sizing.min_size_multiplier,
            max_size_multiplier: self.position_sizing.max_size_multiplier,
            take_profit_bps: self.strategy.take_profit_bps,
            stop_loss_bps: self.strategy.stop_loss_bps,
            max_hold_time_ms: self.strategy.max_hold_time_ms,
            leverage: self.position_sizing.leverage,
            taker_fee_rate: self.position_sizing.taker_fee_rate,
            attach_brackets: self.strategy.attach_brackets,
        }
    }

    pub fn rest_settings(&self) -> RestSettings {
        RestSettings {
            timeout: Duration::from_millis(self.exchange.request_timeout_ms),
            recv_window_ms: Some(self.exchange.recv_window_ms).filter(|ms| *ms > 0),
            retry: RetryPolicy {
                max_retries: self.exchange.max_retries,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.strategy.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.general.symbol, "BTCUSDT");
        assert_eq!(config.risk_limits().max_leverage, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [general]
            symbol = "ETHUSDT"

            [exchange]
            key_type = "ed25519"
            recv_window_ms = 0

            [strategy]
            kline_interval = "15m"
            take_profit_bps = 45

            [position_sizing]
            base_notional_usd = 250
            taker_fee_rate = 0.0005
            "#,
        )
        .unwrap();

        assert_eq!(config.general.symbol, "ETHUSDT");
        assert_eq!(config.exchange.key_type, KeyType::Ed25519);
        assert_eq!(config.strategy.kline_interval, KlineInterval::FifteenMinutes);
        assert_eq!(config.strategy.rsi_period, 14);

        let engine = config.engine_settings();
        assert_eq!(engine.take_profit_bps, dec!(45));
        assert_eq!(engine.base_position_size, dec!(250));
        assert_eq!(engine.taker_fee_rate, dec!(0.0005));

        assert_eq!(config.rest_settings().recv_window_ms, None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml_str("[general]\nsymbol = \"\"").is_err());
        assert!(Config::from_toml_str("[position_sizing]\nleverage = 50").is_err());
        assert!(Config::from_toml_str("[strategy]\nrsi_oversold = 80.0").is_err());
        assert!(Config::from_toml_str("[strategy]\nkline_interval = \"7m\"").is_err());
    }

    #[test]
    fn test_load_shipped_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/desk.toml");
        let config = Config::from_file(path).unwrap();
        assert!(!config.general.symbol.is_empty());
        assert!(config.risk.max_position_usd > Decimal::ZERO);
    }
}
