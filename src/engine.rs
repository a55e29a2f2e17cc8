//! The engine façade: one entry point composing the catalog store, the
//! matcher, the aggregator and the converter.

use crate::aggregation::{PeriodAggregator, RecomputeSummary, DEFAULT_MAX_ATTEMPTS};
use crate::catalog_store::{
    AggregateRecord, CanonicalCountry, CanonicalMarket, CanonicalPriceStage, CanonicalProduct,
    CanonicalVariety, CatalogStore, DeleteOutcome, EntityKind, MatchCandidate,
    NewCanonicalProduct, SourceEntity, UnlinkedFilter,
};
use crate::comparison::{self, Comparison, ComparisonRequest};
use crate::conversion::{self, Conversion, RateTable, RateTableExport};
use crate::error::{EngineError, EngineResult};
use crate::matching::{EntityMatcher, MatchingSummary, NameNormalizer, DEFAULT_AUTO_LINK_THRESHOLD};
use crate::price_stage::PriceStage;
use crate::sources::{IngestSummary, Ingestor, SourceRecord};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunables of the engine, resolved from configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub auto_link_threshold: f64,
    pub extra_stop_tokens: Vec<String>,
    pub max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            auto_link_threshold: DEFAULT_AUTO_LINK_THRESHOLD,
            extra_stop_tokens: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub struct PriceEngine {
    store: Arc<dyn CatalogStore>,
    matcher: EntityMatcher,
    aggregator: PeriodAggregator,
    ingestor: Ingestor,
}

impl PriceEngine {
    pub fn new(store: Arc<dyn CatalogStore>, settings: &EngineSettings) -> Self {
        let normalizer = NameNormalizer::new(settings.extra_stop_tokens.as_slice());
        PriceEngine {
            matcher: EntityMatcher::new(store.clone(), normalizer, settings.auto_link_threshold),
            aggregator: PeriodAggregator::new(store.clone(), settings.max_attempts),
            ingestor: Ingestor::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Point a source entity at a canonical record, or clear the pointer with
    /// `None`. Operator links are manual: the matcher never touches them.
    /// Relinking a source product recomputes the products on both ends.
    pub fn link_entity(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
    ) -> EngineResult<()> {
        let entity = self
            .store
            .get_source_entity(source_id)?
            .ok_or(EngineError::NotFound {
                kind: kind.source_entity_kind(),
                id: source_id,
            })?;
        if entity.kind != kind.source_entity_kind() {
            return Err(EngineError::InvalidLink(format!(
                "source entity {} is a {}, not a {}",
                source_id,
                entity.kind,
                kind.source_entity_kind()
            )));
        }

        if let Some(canonical_id) = canonical_id {
            if !self.store.canonical_exists(kind, canonical_id)? {
                return Err(EngineError::NotFound {
                    kind,
                    id: canonical_id,
                });
            }
            if kind == EntityKind::Variety {
                let parent = self.store.canonical_parent(kind, canonical_id)?;
                if entity.canonical_id.is_none() || parent != entity.canonical_id {
                    return Err(EngineError::InvalidLink(format!(
                        "variety {} does not belong to the product source product {} is linked to",
                        canonical_id, source_id
                    )));
                }
            }
        }

        let score = canonical_id.map(|_| 1.0);
        if !self.store.set_link(kind, source_id, canonical_id, score, true)? {
            return Err(EngineError::InvalidLink(format!(
                "{} link of source entity {} was rejected",
                kind, source_id
            )));
        }
        info!(
            "Manually set {} link of source entity {} to {:?}",
            kind, source_id, canonical_id
        );

        // Moving a source product changes the observation set of both ends
        if kind == EntityKind::Product && entity.canonical_id != canonical_id {
            let affected: Vec<i64> = entity.canonical_id.into_iter().chain(canonical_id).collect();
            let summary = self.aggregator.recompute_products(&affected);
            if !summary.failed.is_empty() {
                warn!(
                    "Aggregates of product(s) {:?} are stale after relinking source {}",
                    summary.failed, source_id
                );
            }
        }
        Ok(())
    }

    pub fn unlink_entity(&self, kind: EntityKind, source_id: i64) -> EngineResult<()> {
        self.link_entity(kind, source_id, None)
    }

    pub fn get_source_entity(&self, source_id: i64) -> EngineResult<SourceEntity> {
        self.store
            .get_source_entity(source_id)?
            .ok_or(EngineError::NotFound {
                kind: EntityKind::Product,
                id: source_id,
            })
    }

    pub fn list_unlinked(
        &self,
        kind: EntityKind,
        filter: &UnlinkedFilter,
    ) -> EngineResult<Vec<SourceEntity>> {
        Ok(self.store.find_unlinked(kind, filter)?)
    }

    // =========================================================================
    // Canonical records
    // =========================================================================

    pub fn create_country(&self, iso_code: &str, name: &str) -> EngineResult<CanonicalCountry> {
        Ok(self.store.create_country(iso_code, name)?)
    }

    pub fn create_market(
        &self,
        country_id: i64,
        name: &str,
        market_type: Option<&str>,
    ) -> EngineResult<CanonicalMarket> {
        if !self.store.canonical_exists(EntityKind::Country, country_id)? {
            return Err(EngineError::NotFound {
                kind: EntityKind::Country,
                id: country_id,
            });
        }
        Ok(self.store.create_market(country_id, name, market_type)?)
    }

    pub fn create_product(&self, product: &NewCanonicalProduct) -> EngineResult<CanonicalProduct> {
        Ok(self.store.create_product(product)?)
    }

    pub fn create_variety(&self, product_id: i64, name: &str) -> EngineResult<CanonicalVariety> {
        if !self.store.canonical_exists(EntityKind::Product, product_id)? {
            return Err(EngineError::NotFound {
                kind: EntityKind::Product,
                id: product_id,
            });
        }
        Ok(self.store.create_variety(product_id, name)?)
    }

    pub fn create_price_stage(&self, code: &str, name: &str) -> EngineResult<CanonicalPriceStage> {
        Ok(self.store.create_price_stage(code, name)?)
    }

    /// Insert the registry's price stages that are not in the catalog yet.
    pub fn seed_price_stages(&self) -> EngineResult<usize> {
        let existing = self.store.list_canonical(EntityKind::PriceStage)?;
        let mut created = 0;
        for stage in PriceStage::ALL {
            let known = existing
                .iter()
                .any(|e| e.names.iter().any(|n| n.eq_ignore_ascii_case(stage.code())));
            if !known {
                self.store
                    .create_price_stage(stage.code(), stage.display_name())?;
                created += 1;
            }
        }
        debug!("Seeded {} price stage(s)", created);
        Ok(created)
    }

    pub fn list_products(&self) -> EngineResult<Vec<CanonicalProduct>> {
        Ok(self.store.list_products()?)
    }

    /// Delete a canonical record that nothing depends on.
    pub fn delete_canonical(&self, kind: EntityKind, id: i64) -> EngineResult<()> {
        match self.store.delete_canonical(kind, id)? {
            DeleteOutcome::Deleted => {
                info!("Deleted canonical {} {}", kind, id);
                Ok(())
            }
            DeleteOutcome::NotFound => Err(EngineError::NotFound { kind, id }),
            DeleteOutcome::HasDependents(count) => {
                Err(EngineError::HasDependents { kind, id, count })
            }
        }
    }

    // =========================================================================
    // Matching
    // =========================================================================

    pub fn run_matching(&self, kind: EntityKind) -> EngineResult<MatchingSummary> {
        self.matcher.run_matching(kind)
    }

    pub fn suggest_links(
        &self,
        kind: EntityKind,
        source_id: i64,
        limit: usize,
    ) -> EngineResult<Vec<MatchCandidate>> {
        self.matcher.suggest(kind, source_id, limit)
    }

    // =========================================================================
    // Ingestion and aggregation
    // =========================================================================

    pub fn ingest_records(&self, records: &[SourceRecord]) -> EngineResult<IngestSummary> {
        self.ingestor.ingest(records)
    }

    pub fn recompute_aggregates_for_product(&self, product_id: i64) -> EngineResult<usize> {
        self.aggregator.recompute_for_product(product_id)
    }

    pub fn recompute_all_aggregates(&self) -> EngineResult<RecomputeSummary> {
        self.aggregator.recompute_all()
    }

    pub fn recompute_for_source_products(
        &self,
        source_ids: &[i64],
    ) -> EngineResult<RecomputeSummary> {
        self.aggregator.recompute_for_source_products(source_ids)
    }

    pub fn aggregates_for_product(&self, product_id: i64) -> EngineResult<Vec<AggregateRecord>> {
        if !self.store.canonical_exists(EntityKind::Product, product_id)? {
            return Err(EngineError::NotFound {
                kind: EntityKind::Product,
                id: product_id,
            });
        }
        Ok(self.store.aggregates_for_product(product_id)?)
    }

    pub fn compare(&self, request: &ComparisonRequest) -> EngineResult<Comparison> {
        comparison::compare(self.store.as_ref(), request)
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Convert with the current rate table. Refusals come back as warnings on
    /// the result; only a failing store is an error.
    pub fn convert(
        &self,
        value: f64,
        from_currency: &str,
        to_currency: &str,
        from_unit: &str,
        to_unit: &str,
    ) -> EngineResult<Conversion> {
        let rates = self.store.load_rate_table()?;
        Ok(conversion::convert(
            value,
            from_currency,
            to_currency,
            from_unit,
            to_unit,
            &rates,
        ))
    }

    pub fn rate_table(&self) -> EngineResult<RateTable> {
        Ok(self.store.load_rate_table()?)
    }

    pub fn rate_table_export(&self) -> EngineResult<RateTableExport> {
        Ok(self.rate_table()?.export())
    }

    pub fn upsert_currency_rate(&self, code: &str, rate_to_base: f64) -> EngineResult<()> {
        Ok(self.store.upsert_currency_rate(code, rate_to_base)?)
    }

    pub fn upsert_unit_rate(
        &self,
        code: &str,
        conversion_rate: f64,
        base_unit: &str,
    ) -> EngineResult<()> {
        Ok(self
            .store
            .upsert_unit_rate(code, conversion_rate, base_unit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::{InMemoryCatalogStore, NewSourceEntity, SourceKind};

    fn engine() -> (InMemoryCatalogStore, PriceEngine) {
        let store = InMemoryCatalogStore::new();
        let engine = PriceEngine::new(Arc::new(store.clone()), &EngineSettings::default());
        (store, engine)
    }

    fn source_product(store: &InMemoryCatalogStore, code: &str) -> i64 {
        store
            .register_source_entity(&NewSourceEntity {
                kind: EntityKind::Product,
                source: SourceKind::Eu,
                external_code: code.to_string(),
                name: code.to_string(),
                local_name: None,
                parent_id: None,
            })
            .unwrap()
    }

    #[test]
    fn test_link_unknown_canonical_is_not_found() {
        let (store, engine) = engine();
        let source = source_product(&store, "POT");
        assert!(matches!(
            engine.link_entity(EntityKind::Product, source, Some(42)),
            Err(EngineError::NotFound { id: 42, .. })
        ));
    }

    #[test]
    fn test_link_wrong_kind_is_invalid() {
        let (store, engine) = engine();
        let source = source_product(&store, "POT");
        let country = engine.create_country("az", "Azerbaijan").unwrap();
        assert!(matches!(
            engine.link_entity(EntityKind::Country, source, Some(country.id)),
            Err(EngineError::InvalidLink(_))
        ));
    }

    #[test]
    fn test_variety_must_belong_to_linked_product() {
        let (store, engine) = engine();
        let source = source_product(&store, "POT");
        let potato = engine
            .create_product(&NewCanonicalProduct {
                name: "Potato".to_string(),
                ..Default::default()
            })
            .unwrap();
        let onion = engine
            .create_product(&NewCanonicalProduct {
                name: "Onion".to_string(),
                ..Default::default()
            })
            .unwrap();
        let red = engine.create_variety(onion.id, "Red").unwrap();
        let early = engine.create_variety(potato.id, "Early").unwrap();

        // No product link yet
        assert!(matches!(
            engine.link_entity(EntityKind::Variety, source, Some(early.id)),
            Err(EngineError::InvalidLink(_))
        ));

        engine
            .link_entity(EntityKind::Product, source, Some(potato.id))
            .unwrap();
        assert!(matches!(
            engine.link_entity(EntityKind::Variety, source, Some(red.id)),
            Err(EngineError::InvalidLink(_))
        ));
        engine
            .link_entity(EntityKind::Variety, source, Some(early.id))
            .unwrap();
        let entity = engine.get_source_entity(source).unwrap();
        assert_eq!(entity.variety_id, Some(early.id));
        assert!(entity.variety_is_manual);
    }

    #[test]
    fn test_manual_link_is_idempotent() {
        let (store, engine) = engine();
        let source = source_product(&store, "POT");
        let potato = engine
            .create_product(&NewCanonicalProduct {
                name: "Potato".to_string(),
                ..Default::default()
            })
            .unwrap();
        engine
            .link_entity(EntityKind::Product, source, Some(potato.id))
            .unwrap();
        engine
            .link_entity(EntityKind::Product, source, Some(potato.id))
            .unwrap();
        let entity = engine.get_source_entity(source).unwrap();
        assert_eq!(entity.canonical_id, Some(potato.id));
        assert_eq!(entity.match_score, Some(1.0));
        assert!(entity.is_manual);

        engine.unlink_entity(EntityKind::Product, source).unwrap();
        let entity = engine.get_source_entity(source).unwrap();
        assert_eq!(entity.canonical_id, None);
        assert!(entity.is_manual);
    }

    #[test]
    fn test_delete_with_dependents_fails() {
        let (store, engine) = engine();
        let source = source_product(&store, "POT");
        let potato = engine
            .create_product(&NewCanonicalProduct {
                name: "Potato".to_string(),
                ..Default::default()
            })
            .unwrap();
        engine
            .link_entity(EntityKind::Product, source, Some(potato.id))
            .unwrap();
        assert!(matches!(
            engine.delete_canonical(EntityKind::Product, potato.id),
            Err(EngineError::HasDependents { count: 1, .. })
        ));

        engine.unlink_entity(EntityKind::Product, source).unwrap();
        engine.delete_canonical(EntityKind::Product, potato.id).unwrap();
        assert!(matches!(
            engine.delete_canonical(EntityKind::Product, potato.id),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_seed_price_stages_is_repeatable() {
        let (_, engine) = engine();
        assert_eq!(engine.seed_price_stages().unwrap(), PriceStage::ALL.len());
        assert_eq!(engine.seed_price_stages().unwrap(), 0);
    }

    #[test]
    fn test_convert_uses_stored_rates() {
        let (_, engine) = engine();
        engine.upsert_currency_rate("C1", 0.55).unwrap();
        engine.upsert_currency_rate("C2", 1.70).unwrap();
        engine.upsert_unit_rate("100kg", 0.01, "kg").unwrap();
        engine.upsert_unit_rate("kg", 1.0, "kg").unwrap();
        let result = engine.convert(150.0, "C1", "C2", "100kg", "kg").unwrap();
        assert!((result.value - 4.636).abs() < 1e-3);

        let export = serde_json::to_value(engine.rate_table_export().unwrap()).unwrap();
        assert_eq!(export["currencies"]["C1"]["rateToBase"], 0.55);
        assert_eq!(export["units"]["100kg"]["baseUnit"], "kg");
    }
}
