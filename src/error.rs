//! Domain error taxonomy for the price engine.

use crate::catalog_store::EntityKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: i64 },

    #[error("{kind} {id} still has {count} dependent item(s)")]
    HasDependents {
        kind: EntityKind,
        id: i64,
        count: usize,
    },

    #[error("Unknown currency or unit code: {0}")]
    UnknownCurrencyOrUnit(String),

    #[error("Cannot convert between units of different dimensions: {from} -> {to}")]
    IncompatibleDimension { from: String, to: String },

    #[error("Aggregation for product {product_id} failed after {attempts} attempt(s): {reason}")]
    AggregationPartialFailure {
        product_id: i64,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether a caller retrying the same operation could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AggregationPartialFailure { .. } | EngineError::Store(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
