use crate::data::{Side, Signal, SignalComponent};
use crate::strategy::indicators::bollinger;
use std::time::SystemTime;

/// Mean reversion on band breaks: below the lower band buys, above the upper sells
pub struct BollingerSignal {
    period: usize,
    k: f64,
}

impl BollingerSignal {
    pub fn new(period: usize, k: f64) -> Self {
        Self { period, k }
    }

    /// Evaluate the last close against bands built from the series
    pub fn evaluate(&self, closes: &[f64]) -> Option<Signal> {
        let bands = bollinger(closes, self.period, self.k)?;
        let price = *closes.last()?;
        let z = bands.z_score(price)?;

        let direction = if price < bands.lower {
            Side::Buy
        } else if price > bands.upper {
            Side::Sell
        } else {
            return None;
        };

        Some(Signal {
            source: "bollinger",
            strength: -z,
            direction,
            confidence: (z.abs() / (self.k + 1.0)).min(1.0),
            timestamp: SystemTime::now(),
            components: vec![
                SignalComponent::new("z_score", z, 1.0),
                SignalComponent::new("percent_b", bands.percent_b(price).unwrap_or(0.5), 0.0),
                SignalComponent::new("bandwidth", bands.bandwidth(), 0.0),
            ],
        })
    }
}
