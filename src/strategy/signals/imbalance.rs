use crate::data::{OrderBook, Side, Signal, SignalComponent};
use statrs::statistics::Statistics;
use std::collections::VecDeque;
use std::time::SystemTime;

/// Order book imbalance detector
///
/// Tracks bid_depth / ask_depth over the top N levels and signals when the
/// latest ratio sits more than `threshold` standard deviations from its
/// rolling mean.
pub struct ImbalanceDetector {
    /// Number of price levels to analyze
    levels: usize,

    /// Rolling window of imbalance ratios
    history: VecDeque<f64>,

    window_size: usize,

    /// Z-score threshold for signal generation
    threshold: f64,

    /// Minimum samples needed before generating signals
    min_samples: usize,
}

impl ImbalanceDetector {
    /// # Arguments
    /// * `levels` - Number of order book levels to analyze (typically 5-10)
    /// * `window_size` - Rolling window size (one sample per poll)
    /// * `threshold` - Z-score threshold for signal (typically 2.0-3.0)
    pub fn new(levels: usize, window_size: usize, threshold: f64) -> Self {
        let window_size = window_size.max(2);
        Self {
            levels,
            history: VecDeque::with_capacity(window_size),
            window_size,
            threshold,
            min_samples: window_size / 2,
        }
    }

    /// Sample the book and return a signal if the imbalance is extreme
    pub fn calculate_signal(&mut self, orderbook: &OrderBook) -> Option<Signal> {
        let ratio = orderbook.calculate_imbalance(self.levels)?;
        self.observe(ratio)
    }

    /// Push one imbalance ratio into the window
    pub fn observe(&mut self, ratio: f64) -> Option<Signal> {
        if !ratio.is_finite() {
            return None;
        }

        self.history.push_back(ratio);
        if self.history.len() > self.window_size {
            self.history.pop_front();
        }

        if self.history.len() < self.min_samples {
            return None;
        }

        let (mean, stddev) = self.mean_and_stddev();
        if stddev < 1e-6 {
            return None;
        }

        let z_score = (ratio - mean) / stddev;
        if z_score.abs() < self.threshold {
            return None;
        }

        // More bids than usual is bullish
        let direction = if z_score > 0.0 { Side::Buy } else { Side::Sell };
        let confidence = (z_score.abs() / (self.threshold + 1.0)).min(1.0);

        Some(Signal {
            source: "imbalance",
            strength: z_score,
            direction,
            confidence,
            timestamp: SystemTime::now(),
            components: vec![
                SignalComponent::new("imbalance_ratio", ratio, 1.0),
                SignalComponent::new("mean", mean, 0.0),
                SignalComponent::new("stddev", stddev, 0.0),
                SignalComponent::new("z_score", z_score, 1.0),
            ],
        })
    }

    fn mean_and_stddev(&self) -> (f64, f64) {
        if self.history.len() < 2 {
            return (self.history.back().copied().unwrap_or(0.0), 0.0);
        }
        (
            self.history.iter().mean(),
            self.history.iter().population_std_dev(),
        )
    }

    pub fn get_stats(&self) -> ImbalanceStats {
        let (mean, stddev) = self.mean_and_stddev();

        ImbalanceStats {
            current_ratio: self.history.back().copied(),
            mean,
            stddev,
            sample_count: self.history.len(),
        }
    }

    /// Clear the window
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ImbalanceStats {
    pub current_ratio: Option<f64>,
    pub mean: f64,
    pub stddev: f64,
    pub sample_count: usize,
}
