use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Risk limit violation
#[derive(Debug, Clone)]
pub struct RiskViolation {
    pub reason: String,
    pub severity: ViolationSeverity,
}

impl fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.severity, self.reason)
    }
}

impl std::error::Error for RiskViolation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationSeverity {
    Warning,   // Log but allow trade
    Block,     // Prevent trade
    Emergency, // Close all positions
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max notional (USD) of a single position
    pub max_position_notional: Decimal,
    pub max_portfolio_exposure: Decimal,
    pub max_leverage: u32,

    pub max_daily_loss: Decimal,
    pub max_drawdown_percent: Decimal,

    pub max_trades_per_hour: usize,
    pub max_trades_per_day: usize,

    pub max_acceptable_latency_ms: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_notional: Decimal::from(5000),
            max_portfolio_exposure: Decimal::from(10000),
            max_leverage: 10,
            max_daily_loss: Decimal::from(500),
            max_drawdown_percent: Decimal::from(10),
            max_trades_per_hour: 30,
            max_trades_per_day: 200,
            max_acceptable_latency_ms: 500,
        }
    }
}

/// Pre-trade checks plus the circuit breaker
pub struct RiskManager {
    limits: RiskLimits,

    daily_pnl: Decimal,
    daily_trades: usize,
    trading_day: NaiveDate,

    hourly_trades: VecDeque<DateTime<Utc>>,

    peak_equity: Decimal,
    current_equity: Decimal,

    recent_latencies: VecDeque<u64>,

    trading_halted: bool,
    halt_reason: Option<String>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, initial_equity: Decimal) -> Self {
        Self {
            limits,
            daily_pnl: Decimal::ZERO,
            daily_trades: 0,
            trading_day: Utc::now().date_naive(),
            hourly_trades: VecDeque::new(),
            peak_equity: initial_equity,
            current_equity: initial_equity,
            recent_latencies: VecDeque::new(),
            trading_halted: false,
            halt_reason: None,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Check whether a new position of `notional` may be opened
    pub fn can_open_position(
        &mut self,
        notional: Decimal,
        current_exposure: Decimal,
        leverage: u32,
    ) -> Result<(), RiskViolation> {
        self.can_open_position_at(notional, current_exposure, leverage, Utc::now())
    }

    pub fn can_open_position_at(
        &mut self,
        notional: Decimal,
        current_exposure: Decimal,
        leverage: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RiskViolation> {
        self.roll_day(now);

        if self.trading_halted {
            return Err(RiskViolation {
                reason: format!(
                    "Trading halted: {}",
                    self.halt_reason.as_deref().unwrap_or("Unknown")
                ),
                severity: ViolationSeverity::Emergency,
            });
        }

        if notional > self.limits.max_position_notional {
            return Err(RiskViolation {
                reason: format!(
                    "Position notional {} exceeds limit {}",
                    notional, self.limits.max_position_notional
                ),
                severity: ViolationSeverity::Block,
            });
        }

        let new_exposure = current_exposure + notional;
        if new_exposure > self.limits.max_portfolio_exposure {
            return Err(RiskViolation {
                reason: format!(
                    "Portfolio exposure {} exceeds limit {}",
                    new_exposure, self.limits.max_portfolio_exposure
                ),
                severity: ViolationSeverity::Block,
            });
        }

        if leverage > self.limits.max_leverage {
            return Err(RiskViolation {
                reason: format!(
                    "Leverage {}x exceeds limit {}x",
                    leverage, self.limits.max_leverage
                ),
                severity: ViolationSeverity::Block,
            });
        }

        if self.daily_pnl < -self.limits.max_daily_loss {
            self.halt_trading("Daily loss limit exceeded");
            return Err(RiskViolation {
                reason: format!(
                    "Daily loss {} exceeds limit {}",
                    self.daily_pnl, self.limits.max_daily_loss
                ),
                severity: ViolationSeverity::Emergency,
            });
        }

        let drawdown = self.calculate_drawdown();
        if drawdown > self.limits.max_drawdown_percent {
            self.halt_trading("Drawdown limit exceeded");
            return Err(RiskViolation {
                reason: format!(
                    "Drawdown {}% exceeds limit {}%",
                    drawdown.round_dp(2),
                    self.limits.max_drawdown_percent
                ),
                severity: ViolationSeverity::Emergency,
            });
        }

        self.cleanup_old_trades(now);
        if self.hourly_trades.len() >= self.limits.max_trades_per_hour {
            return Err(RiskViolation {
                reason: format!("Hourly trade limit {} reached", self.limits.max_trades_per_hour),
                severity: ViolationSeverity::Block,
            });
        }

        if self.daily_trades >= self.limits.max_trades_per_day {
            return Err(RiskViolation {
                reason: format!("Daily trade limit {} reached", self.limits.max_trades_per_day),
                severity: ViolationSeverity::Block,
            });
        }

        if let Some(avg_latency) = self.average_latency() {
            if avg_latency > self.limits.max_acceptable_latency_ms {
                return Err(RiskViolation {
                    reason: format!(
                        "Average latency {}ms exceeds limit {}ms",
                        avg_latency, self.limits.max_acceptable_latency_ms
                    ),
                    severity: ViolationSeverity::Warning,
                });
            }
        }

        Ok(())
    }

    /// Record a completed trade's realized PnL
    pub fn record_trade(&mut self, pnl: Decimal) {
        self.record_trade_at(pnl, Utc::now());
    }

    pub fn record_trade_at(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.roll_day(now);

        self.hourly_trades.push_back(now);
        self.daily_trades += 1;
        self.daily_pnl += pnl;
        self.current_equity += pnl;

        if self.current_equity > self.peak_equity {
            self.peak_equity = self.current_equity;
        }
    }

    /// Record order round-trip latency; 8 slow samples out of the last 10 halt trading
    pub fn record_latency(&mut self, latency_ms: u64) {
        self.recent_latencies.push_back(latency_ms);
        if self.recent_latencies.len() > 100 {
            self.recent_latencies.pop_front();
        }

        if self.recent_latencies.len() >= 10 {
            let slow = self
                .recent_latencies
                .iter()
                .rev()
                .take(10)
                .filter(|&&l| l > self.limits.max_acceptable_latency_ms)
                .count();

            if slow >= 8 {
                self.halt_trading("Consistent high latency detected");
            }
        }
    }

    fn calculate_drawdown(&self) -> Decimal {
        if self.peak_equity.is_zero() {
            return Decimal::ZERO;
        }
        (self.peak_equity - self.current_equity) / self.peak_equity * Decimal::from(100)
    }

    fn average_latency(&self) -> Option<u64> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_latencies.iter().sum();
        Some(sum / self.recent_latencies.len() as u64)
    }

    fn cleanup_old_trades(&mut self, now: DateTime<Utc>) {
        let one_hour_ago = now - chrono::Duration::hours(1);
        while let Some(&trade_time) = self.hourly_trades.front() {
            if trade_time < one_hour_ago {
                self.hourly_trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// Reset daily counters on the UTC day boundary
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.trading_day {
            self.daily_pnl = Decimal::ZERO;
            self.daily_trades = 0;
            self.trading_day = today;
        }
    }

    pub fn halt_trading(&mut self, reason: &str) {
        if !self.trading_halted {
            tracing::warn!(reason, "trading halted");
        }
        self.trading_halted = true;
        self.halt_reason = Some(reason.to_string());
    }

    /// Manual override
    pub fn resume_trading(&mut self) {
        self.trading_halted = false;
        self.halt_reason = None;
    }

    pub fn is_halted(&self) -> bool {
        self.trading_halted
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    pub fn get_metrics(&self) -> RiskMetrics {
        RiskMetrics {
            daily_pnl: self.daily_pnl,
            daily_trades: self.daily_trades,
            hourly_trades: self.hourly_trades.len(),
            drawdown_percent: self.calculate_drawdown(),
            current_equity: self.current_equity,
            peak_equity: self.peak_equity,
            average_latency_ms: self.average_latency(),
            trading_halted: self.trading_halted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub daily_pnl: Decimal,
    pub daily_trades: usize,
    pub hourly_trades: usize,
    pub drawdown_percent: Decimal,
    pub current_equity: Decimal,
    pub peak_equity: Decimal,
    pub average_latency_ms: Option<u64>,
    pub trading_halted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn manager() -> RiskManager {
        RiskManager::new(RiskLimits::default(), dec!(10000))
    }

    #[test]
    fn test_position_notional_limit() {
        let mut manager = manager();
        assert!(manager.can_open_position(dec!(4000), dec!(0), 5).is_ok());

        let result = manager.can_open_position(dec!(6000), dec!(0), 5);
        assert_eq!(result.unwrap_err().severity, ViolationSeverity::Block);
    }

    #[test]
    fn test_portfolio_exposure_limit() {
        let mut manager = manager();
        assert!(manager.can_open_position(dec!(3000), dec!(8000), 5).is_err());
    }

    #[test]
    fn test_leverage_limit() {
        let mut manager = manager();
        let err = manager.can_open_position(dec!(1000), dec!(0), 20).unwrap_err();
        assert_eq!(err.severity, ViolationSeverity::Block);
        assert!(err.reason.contains("Leverage"));
    }

    #[test]
    fn test_daily_loss_limit_halts() {
        let mut manager = manager();
        manager.record_trade(dec!(-200));
        manager.record_trade(dec!(-200));
        manager.record_trade(dec!(-150));

        let result = manager.can_open_position(dec!(1000), dec!(0), 1);
        assert_eq!(result.unwrap_err().severity, ViolationSeverity::Emergency);
        assert!(manager.is_halted());
    }

    #[test]
    fn test_daily_counters_roll_at_utc_midnight() {
        let mut limits = RiskLimits::default();
        limits.max_drawdown_percent = dec!(50);
        let mut manager = RiskManager::new(limits, dec!(10000));

        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        manager.record_trade_at(dec!(-600), late);
        assert_eq!(manager.get_metrics().daily_pnl, dec!(-600));

        let next_morning = Utc.with_ymd_and_hms(2026, 3, 2, 0, 45, 0).unwrap();
        assert!(manager
            .can_open_position_at(dec!(1000), dec!(0), 1, next_morning)
            .is_ok());
        assert_eq!(manager.get_metrics().daily_pnl, dec!(0));
        assert_eq!(manager.get_metrics().daily_trades, 0);
    }

    #[test]
    fn test_drawdown_limit() {
        let mut manager = manager();
        manager.record_trade(dec!(-1100));
        assert!(manager.can_open_position(dec!(1000), dec!(0), 1).is_err());
        assert!(manager.is_halted());
    }

    #[test]
    fn test_hourly_trade_limit_expires() {
        let mut limits = RiskLimits::default();
        limits.max_trades_per_hour = 5;
        let mut manager = RiskManager::new(limits, dec!(10000));

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        for _ in 0..5 {
            manager.record_trade_at(dec!(10), start);
        }
        assert!(manager.can_open_position_at(dec!(1000), dec!(0), 1, start).is_err());

        let later = start + chrono::Duration::minutes(61);
        assert!(manager.can_open_position_at(dec!(1000), dec!(0), 1, later).is_ok());
    }

    #[test]
    fn test_latency_tracking() {
        let mut manager = manager();
        for _ in 0..5 {
            manager.record_latency(50);
        }
        assert_eq!(manager.average_latency(), Some(50));

        for _ in 0..10 {
            manager.record_latency(600);
        }
        assert!(manager.is_halted());
    }

    #[test]
    fn test_resume_trading() {
        let mut manager = manager();
        manager.halt_trading("manual");
        assert_eq!(manager.halt_reason(), Some("manual"));
        manager.resume_trading();
        assert!(!manager.is_halted());
    }
}
