//! Period aggregation of raw observations.

mod aggregator;
mod period;

pub use aggregator::{PeriodAggregator, RecomputeSummary, DEFAULT_MAX_ATTEMPTS};
pub use period::{calendar_bounds, PeriodKey};
