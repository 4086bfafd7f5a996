pub mod position;
pub mod limits;

pub use position::{ClosedTrade, Position, PositionBook};
pub use limits::{RiskManager, RiskLimits, RiskMetrics, RiskViolation, ViolationSeverity};
