//! CatalogStore trait definition.
//!
//! This trait abstracts persistence of the identity graph, observations,
//! aggregates and rate tables so that the engine can run against either the
//! `SqliteCatalogStore` or the `InMemoryCatalogStore` used by tests.

use super::models::*;
use crate::conversion::RateTable;
use anyhow::Result;
use std::collections::HashMap;

/// A source price-stage entity that an operator (or the matcher) linked to a
/// canonical stage: `(source, external_code, canonical_code)`.
pub type StageLink = (SourceKind, String, String);

/// Trait for catalog storage backends.
///
/// Every method is a single atomic unit of work against the backing store.
pub trait CatalogStore: Send + Sync {
    // =========================================================================
    // Canonical Records
    // =========================================================================

    fn create_country(&self, iso_code: &str, name: &str) -> Result<CanonicalCountry>;

    fn create_market(
        &self,
        country_id: i64,
        name: &str,
        market_type: Option<&str>,
    ) -> Result<CanonicalMarket>;

    fn create_product(&self, product: &NewCanonicalProduct) -> Result<CanonicalProduct>;

    fn create_variety(&self, product_id: i64, name: &str) -> Result<CanonicalVariety>;

    fn create_price_stage(&self, code: &str, name: &str) -> Result<CanonicalPriceStage>;

    fn get_product(&self, id: i64) -> Result<Option<CanonicalProduct>>;

    fn list_products(&self) -> Result<Vec<CanonicalProduct>>;

    fn canonical_exists(&self, kind: EntityKind, id: i64) -> Result<bool>;

    /// Owning record of a canonical entity: the product of a variety, the
    /// country of a market. `None` for kinds without a parent.
    fn canonical_parent(&self, kind: EntityKind, id: i64) -> Result<Option<i64>>;

    /// All records of one kind as match candidates, ordered by id.
    fn list_canonical(&self, kind: EntityKind) -> Result<Vec<CanonicalEntity>>;

    /// Number of items still pointing at a canonical record.
    fn count_dependents(&self, kind: EntityKind, id: i64) -> Result<usize>;

    /// Delete a canonical record only if nothing depends on it. The check and
    /// the delete happen in one unit of work.
    fn delete_canonical(&self, kind: EntityKind, id: i64) -> Result<DeleteOutcome>;

    // =========================================================================
    // Source Entities and Links
    // =========================================================================

    /// Insert a source entity, or return the id of the existing one with the
    /// same `(kind, source, external_code)`.
    fn register_source_entity(&self, entity: &NewSourceEntity) -> Result<i64>;

    fn get_source_entity(&self, id: i64) -> Result<Option<SourceEntity>>;

    /// Source entities carrying the link for `kind` that have no link yet.
    /// For varieties: source products linked to a product but not a variety.
    fn find_unlinked(&self, kind: EntityKind, filter: &UnlinkedFilter)
        -> Result<Vec<SourceEntity>>;

    /// Unconditional pointer overwrite used by operators. Returns false when
    /// the source entity does not exist (or, for varieties, when the variety
    /// is not nested under the source product's canonical product).
    fn set_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: Option<f64>,
        is_manual: bool,
    ) -> Result<bool>;

    /// Conditional write used by the matcher: only applies while the entity is
    /// still unlinked and not manually curated. Returns whether a row changed.
    fn try_auto_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: f64,
    ) -> Result<bool>;

    /// Source product ids linked to a canonical product directly or through
    /// one of its varieties, ordered by id.
    fn source_products_for_canonical(&self, product_id: i64) -> Result<Vec<i64>>;

    /// Distinct canonical products the given source products are linked to.
    fn canonical_products_for_sources(&self, source_ids: &[i64]) -> Result<Vec<i64>>;

    /// Every canonical product with at least one linked source product or
    /// at least one stored aggregate, ordered by id.
    fn aggregation_candidate_ids(&self) -> Result<Vec<i64>>;

    fn price_stage_links(&self) -> Result<Vec<StageLink>>;

    /// Market-type hints of the canonical markets behind the given source
    /// market ids, keyed by source market id.
    fn market_type_hints(&self, market_refs: &[i64]) -> Result<HashMap<i64, String>>;

    // =========================================================================
    // Observations
    // =========================================================================

    fn insert_observations(&self, observations: &[NewRawObservation]) -> Result<usize>;

    /// Observations of the given source products ordered by `(period_date, id)`.
    fn observations_for_source_products(&self, source_ids: &[i64]) -> Result<Vec<RawObservation>>;

    // =========================================================================
    // Aggregates
    // =========================================================================

    /// Atomically replace the whole aggregate set of one product. On error the
    /// previous set is left untouched.
    fn replace_aggregates(&self, product_id: i64, records: &[AggregateRecord]) -> Result<()>;

    /// Aggregates of one product, ordered by key.
    fn aggregates_for_product(&self, product_id: i64) -> Result<Vec<AggregateRecord>>;

    // =========================================================================
    // Rate Tables
    // =========================================================================

    fn upsert_currency_rate(&self, code: &str, rate_to_base: f64) -> Result<()>;

    fn upsert_unit_rate(&self, code: &str, conversion_rate: f64, base_unit: &str) -> Result<()>;

    fn load_rate_table(&self) -> Result<RateTable>;
}
