use crate::data::{Side, Signal};
use std::cmp::Ordering;
use std::time::SystemTime;

/// Composite signal combining multiple signal sources
///
/// Aggregates signals from different detectors and decides whether
/// to trade based on:
/// 1. Primary signal strength
/// 2. Number of confirming signals
/// 3. Overall confidence
#[derive(Debug, Clone)]
pub struct CompositeSignal {
    /// Strongest signal (drives the decision)
    pub primary: Signal,

    /// Confirming signals (same direction)
    pub confirming: Vec<Signal>,

    /// Weighted signed strength
    pub overall_strength: f64,

    pub direction: Side,

    /// Composite confidence (0.0 to 1.0)
    pub confidence: f64,

    pub timestamp: SystemTime,
}

impl CompositeSignal {
    /// Check if this signal is strong enough to trade
    pub fn is_tradeable(&self, min_confirming: usize) -> bool {
        self.confirming.len() >= min_confirming && self.confidence >= 0.5
    }

    /// Source names, primary first
    pub fn sources(&self) -> Vec<&'static str> {
        std::iter::once(self.primary.source)
            .chain(self.confirming.iter().map(|s| s.source))
            .collect()
    }
}

pub struct SignalAggregator {
    /// Minimum |strength| for the primary
    primary_threshold: f64,

    /// Minimum |strength| for a confirming signal
    confirming_threshold: f64,

    min_confirming: usize,
}

impl SignalAggregator {
    /// # Arguments
    /// * `primary_threshold` - Min strength for primary signal (e.g., 2.0)
    /// * `confirming_threshold` - Min strength for confirming (e.g., 1.0)
    /// * `min_confirming` - Min number of confirming signals (e.g., 1)
    pub fn new(primary_threshold: f64, confirming_threshold: f64, min_confirming: usize) -> Self {
        Self {
            primary_threshold,
            confirming_threshold,
            min_confirming,
        }
    }

    pub fn min_confirming(&self) -> usize {
        self.min_confirming
    }

    /// Aggregate signals into a composite, or None when criteria are not met
    pub fn aggregate(&self, signals: Vec<Signal>) -> Option<CompositeSignal> {
        let (primary_idx, primary) = signals.iter().enumerate().max_by(|(_, a), (_, b)| {
            a.abs_strength()
                .partial_cmp(&b.abs_strength())
                .unwrap_or(Ordering::Equal)
        })?;

        if primary.abs_strength() < self.primary_threshold {
            return None;
        }

        let confirming: Vec<Signal> = signals
            .iter()
            .enumerate()
            .filter(|(idx, s)| {
                *idx != primary_idx
                    && s.direction == primary.direction
                    && s.abs_strength() >= self.confirming_threshold
            })
            .map(|(_, s)| s.clone())
            .collect();

        if confirming.len() < self.min_confirming {
            return None;
        }

        let confidence = self.calculate_composite_confidence(primary, &confirming);
        let overall_strength = self.calculate_overall_strength(primary, &confirming);

        Some(CompositeSignal {
            direction: primary.direction,
            overall_strength,
            confidence,
            timestamp: SystemTime::now(),
            primary: primary.clone(),
            confirming,
        })
    }

    /// Primary confidence (40%), confirming count (30%), mean confirming
    /// confidence (30%)
    fn calculate_composite_confidence(&self, primary: &Signal, confirming: &[Signal]) -> f64 {
        let primary_conf = primary.confidence * 0.4;

        let count_factor = (confirming.len() as f64 / (self.min_confirming as f64 + 2.0)).min(1.0);
        let count_conf = count_factor * 0.3;

        let confirming_conf = mean(confirming.iter().map(|s| s.confidence)) * 0.3;

        (primary_conf + count_conf + confirming_conf).min(1.0)
    }

    /// Primary 60%, mean confirming 40%
    fn calculate_overall_strength(&self, primary: &Signal, confirming: &[Signal]) -> f64 {
        primary.strength * 0.6 + mean(confirming.iter().map(|s| s.strength)) * 0.4
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
