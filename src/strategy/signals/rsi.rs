use crate::data::{Side, Signal, SignalComponent};
use crate::strategy::indicators::rsi;
use std::time::SystemTime;

/// Oversold / overbought rule on Wilder RSI
pub struct RsiSignal {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiSignal {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Self {
        Self {
            period,
            oversold,
            overbought,
        }
    }

    /// Evaluate against a close series (oldest first)
    pub fn evaluate(&self, closes: &[f64]) -> Option<Signal> {
        let value = rsi(closes, self.period)?;
        self.from_value(value)
    }

    /// Build a signal from an already computed RSI
    pub fn from_value(&self, value: f64) -> Option<Signal> {
        let (direction, confidence) = if value < self.oversold {
            (Side::Buy, (self.oversold - value) / self.oversold.max(f64::EPSILON))
        } else if value > self.overbought {
            (
                Side::Sell,
                (value - self.overbought) / (100.0 - self.overbought).max(f64::EPSILON),
            )
        } else {
            return None;
        };

        Some(Signal {
            source: "rsi",
            strength: (50.0 - value) / 10.0,
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: SystemTime::now(),
            components: vec![
                SignalComponent::new("rsi", value, 1.0),
                SignalComponent::new("oversold", self.oversold, 0.0),
                SignalComponent::new("overbought", self.overbought, 0.0),
            ],
        })
    }
}
