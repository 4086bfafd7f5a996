pub mod execution;
pub mod indicators;
pub mod signals;

pub use execution::{EngineSettings, ExecutionEngine, ExecutionResult, FlattenReport, TradingStats};
pub use indicators::{bollinger, ema, rsi, sma, BollingerBands, Rsi};
pub use signals::{
    BollingerSignal, CompositeSignal, ImbalanceDetector, ImbalanceStats, RsiSignal, SignalAggregator,
};
