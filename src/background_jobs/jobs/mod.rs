//! Specific background job implementations.

pub mod aggregate_recompute;
pub mod entity_matching;

pub use aggregate_recompute::AggregateRecomputeJob;
pub use entity_matching::EntityMatchingJob;
