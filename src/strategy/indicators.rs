//! Indicator math over close series.
//!
//! Batch helpers take a slice and look at its tail; `Rsi` can also be fed
//! one close at a time.

use statrs::statistics::Statistics;

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().mean())
}

/// Exponential moving average seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().mean();

    Some(
        values[period..]
            .iter()
            .fold(seed, |acc, price| acc * (1.0 - alpha) + price * alpha),
    )
}

/// Streaming Wilder RSI
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: f64,
    avg_loss: f64,
    prev_close: Option<f64>,
    count: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            avg_gain: 0.0,
            avg_loss: 0.0,
            prev_close: None,
            count: 0,
        }
    }

    /// Feed one close; returns the RSI once `period` changes have been seen
    pub fn update(&mut self, close: f64) -> Option<f64> {
        if let Some(prev) = self.prev_close {
            let change = close - prev;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);

            self.count += 1;
            if self.count <= self.period {
                // Seed with simple means
                let n = self.count as f64;
                self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
                self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
            } else {
                let p = self.period as f64;
                self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
                self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
            }
        }
        self.prev_close = Some(close);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        if self.avg_loss == 0.0 {
            return Some(if self.avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        let rs = self.avg_gain / self.avg_loss;
        Some((100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0))
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// RSI over a whole close series; needs `period + 1` closes
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let mut rsi = Rsi::new(period);
    closes.iter().fold(None, |_, close| rsi.update(*close))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub std_dev: f64,
    pub k: f64,
}

impl BollingerBands {
    /// Position within the bands: 0 at lower, 1 at upper
    pub fn percent_b(&self, price: f64) -> Option<f64> {
        if self.std_dev == 0.0 {
            return None;
        }
        Some((price - self.lower) / (self.upper - self.lower))
    }

    /// Band width relative to the middle band
    pub fn bandwidth(&self) -> f64 {
        if self.middle == 0.0 {
            return 0.0;
        }
        (self.upper - self.lower) / self.middle
    }

    /// Standard deviations from the middle band
    pub fn z_score(&self, price: f64) -> Option<f64> {
        if self.std_dev == 0.0 {
            return None;
        }
        Some((price - self.middle) / self.std_dev)
    }
}

/// Bollinger bands over the last `period` closes using population std
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let middle = window.iter().mean();
    let std_dev = window.iter().population_std_dev();
    if !std_dev.is_finite() {
        return None;
    }

    Some(BollingerBands {
        upper: middle + k * std_dev,
        middle,
        lower: middle - k * std_dev,
        std_dev,
        k,
    })
}
