pub mod bollinger;
pub mod composite;
pub mod imbalance;
pub mod rsi;

pub use bollinger::BollingerSignal;
pub use composite::{CompositeSignal, SignalAggregator};
pub use imbalance::{ImbalanceDetector, ImbalanceStats};
pub use rsi::RsiSignal;
