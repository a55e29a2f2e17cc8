//! Agricultural Price Engine Library
//!
//! Normalizes price observations from several national and international
//! feeds into one canonical catalog, and derives comparable period
//! aggregates from them. The binaries are thin shells over this library.

pub mod aggregation;
pub mod background_jobs;
pub mod catalog_store;
pub mod cli_style;
pub mod comparison;
pub mod config;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod price_stage;
pub mod sources;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use catalog_store::{CatalogStore, InMemoryCatalogStore, SqliteCatalogStore};
pub use engine::{EngineSettings, PriceEngine};
pub use error::{EngineError, EngineResult};
