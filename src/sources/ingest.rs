//! Deposit path for source records.
//!
//! Registers every source entity a record mentions (product, market or
//! country, price stage) on first sight, then stores the extracted
//! observations. Entity resolution is left to the matcher.

use super::records::{CountryRef, LocationRef, ObservationSource, SourceRecord};
use crate::catalog_store::{CatalogStore, EntityKind, NewRawObservation, NewSourceEntity, SourceKind};
use crate::error::EngineResult;
use crate::metrics;
use crate::price_stage::PriceStage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub observations: usize,
    pub skipped: usize,
    /// Source products that received observations, for targeted recompute.
    pub source_products: Vec<i64>,
}

type EntityKey = (EntityKind, SourceKind, String);

pub struct Ingestor {
    store: Arc<dyn CatalogStore>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Ingestor { store }
    }

    pub fn ingest(&self, records: &[SourceRecord]) -> EngineResult<IngestSummary> {
        let mut registered: HashMap<EntityKey, i64> = HashMap::new();
        let mut prelinked: BTreeSet<i64> = BTreeSet::new();
        let mut observations = Vec::with_capacity(records.len());
        let mut skipped = 0;

        for record in records {
            let record = record.as_observation();
            match self.extract(record, &mut registered, &mut prelinked)? {
                Some(observation) => observations.push(observation),
                None => skipped += 1,
            }
        }

        let stored = if observations.is_empty() {
            0
        } else {
            self.store.insert_observations(&observations)?
        };

        let mut per_source: BTreeMap<SourceKind, usize> = BTreeMap::new();
        for obs in &observations {
            *per_source.entry(obs.source).or_default() += 1;
        }
        for (source, count) in per_source {
            metrics::record_observations_ingested(source.to_db_str(), count);
        }

        let source_products: BTreeSet<i64> =
            observations.iter().map(|o| o.source_product_id).collect();
        info!(
            "Ingested {} observation(s) for {} source product(s), skipped {}",
            stored,
            source_products.len(),
            skipped
        );
        Ok(IngestSummary {
            observations: stored,
            skipped,
            source_products: source_products.into_iter().collect(),
        })
    }

    fn extract(
        &self,
        record: &dyn ObservationSource,
        registered: &mut HashMap<EntityKey, i64>,
        prelinked: &mut BTreeSet<i64>,
    ) -> EngineResult<Option<NewRawObservation>> {
        let source = record.source();
        let product = record.product();

        let Some(period_date) = record.period_date() else {
            warn!("Skipping {} record for '{}': no valid date", source, product.name);
            return Ok(None);
        };
        let (low, avg, high) = record.values();
        if !avg.is_finite() || avg < 0.0 {
            warn!(
                "Skipping {} record for '{}' on {}: invalid price {}",
                source, product.name, period_date, avg
            );
            return Ok(None);
        }
        let stage_key = PriceStage::key(record.price_stage());
        if stage_key.is_empty() {
            warn!("Skipping {} record for '{}': empty price stage", source, product.name);
            return Ok(None);
        }

        let source_product_id = self.register(
            registered,
            NewSourceEntity {
                kind: EntityKind::Product,
                source,
                external_code: product.code.to_string(),
                name: product.name.to_string(),
                local_name: product.local_name.map(str::to_string),
                parent_id: None,
            },
        )?;
        self.register(
            registered,
            NewSourceEntity {
                kind: EntityKind::PriceStage,
                source,
                external_code: stage_key,
                name: record.price_stage().trim().to_string(),
                local_name: None,
                parent_id: None,
            },
        )?;
        let market_ref = match record.location() {
            Some(location) => Some(self.register_location(registered, source, location)?),
            None => None,
        };

        let canonical_product_ref = record.canonical_product_ref();
        if let Some(product_id) = canonical_product_ref {
            if prelinked.insert(source_product_id) {
                self.prelink(source_product_id, product_id)?;
            }
        }

        // Bounds that are missing or on the wrong side of avg collapse onto it
        let value_low = low.filter(|v| v.is_finite()).map_or(avg, |v| v.min(avg));
        let value_high = high.filter(|v| v.is_finite()).map_or(avg, |v| v.max(avg));

        Ok(Some(NewRawObservation {
            source,
            source_product_id,
            canonical_product_ref,
            market_ref,
            price_stage: record.price_stage().to_string(),
            period_date,
            value_low,
            value_avg: avg,
            value_high,
            currency: record.currency().trim().to_string(),
            unit: record.unit().trim().to_string(),
        }))
    }

    fn register(
        &self,
        registered: &mut HashMap<EntityKey, i64>,
        entity: NewSourceEntity,
    ) -> EngineResult<i64> {
        let key = (entity.kind, entity.source, entity.external_code.clone());
        if let Some(id) = registered.get(&key) {
            return Ok(*id);
        }
        let id = self.store.register_source_entity(&entity)?;
        registered.insert(key, id);
        Ok(id)
    }

    fn register_country(
        &self,
        registered: &mut HashMap<EntityKey, i64>,
        source: SourceKind,
        country: CountryRef<'_>,
    ) -> EngineResult<i64> {
        self.register(
            registered,
            NewSourceEntity {
                kind: EntityKind::Country,
                source,
                external_code: country.code.to_string(),
                name: country.name.to_string(),
                local_name: None,
                parent_id: None,
            },
        )
    }

    fn register_location(
        &self,
        registered: &mut HashMap<EntityKey, i64>,
        source: SourceKind,
        location: LocationRef<'_>,
    ) -> EngineResult<i64> {
        match location {
            LocationRef::Country(country) => self.register_country(registered, source, country),
            LocationRef::Market {
                code,
                name,
                country,
            } => {
                // Market codes are only unique within their country
                let external_code = match country {
                    Some(country) => format!("{}/{}", country.code, code),
                    None => code.to_string(),
                };
                let parent_id = match country {
                    Some(country) => Some(self.register_country(registered, source, country)?),
                    None => None,
                };
                self.register(
                    registered,
                    NewSourceEntity {
                        kind: EntityKind::Market,
                        source,
                        external_code,
                        name: name.to_string(),
                        local_name: None,
                        parent_id,
                    },
                )
            }
        }
    }

    /// Apply the feed's own product reference to a source product nobody
    /// has decided on yet.
    fn prelink(&self, source_product_id: i64, product_id: i64) -> EngineResult<()> {
        if !self.store.canonical_exists(EntityKind::Product, product_id)? {
            warn!(
                "Source product {} references unknown canonical product {}",
                source_product_id, product_id
            );
            return Ok(());
        }
        if self
            .store
            .try_auto_link(EntityKind::Product, source_product_id, Some(product_id), 1.0)?
        {
            debug!(
                "Pre-linked source product {} to canonical product {}",
                source_product_id, product_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::{InMemoryCatalogStore, NewCanonicalProduct, UnlinkedFilter};
    use crate::sources::{AzRecord, FpmaRecord};
    use chrono::NaiveDate;

    fn az(code: &str, min: Option<f64>, avg: f64, max: Option<f64>) -> SourceRecord {
        SourceRecord::Az(AzRecord {
            product_code: code.to_string(),
            product_name: format!("Product {}", code),
            local_name: None,
            region_code: Some("GNJ".to_string()),
            region_name: Some("Ganja".to_string()),
            price_stage: "Topdan".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            min_price: min,
            avg_price: avg,
            max_price: max,
            currency: "AZN".to_string(),
            unit: "kg".to_string(),
            canonical_product_id: None,
        })
    }

    fn fpma(market_code: &str, country: &str) -> SourceRecord {
        SourceRecord::Fpma(FpmaRecord {
            commodity_code: "RICE".to_string(),
            commodity: "Rice".to_string(),
            market_code: market_code.to_string(),
            market: "Capital".to_string(),
            country_iso: country.to_string(),
            country_name: country.to_string(),
            price_type: "Retail prices".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            price: 1.5,
            currency: "USD".to_string(),
            unit: "kg".to_string(),
        })
    }

    #[test]
    fn test_entities_registered_once() {
        let store = InMemoryCatalogStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()));
        let summary = ingestor
            .ingest(&[az("P1", None, 1.0, None), az("P1", None, 2.0, None)])
            .unwrap();
        assert_eq!(summary.observations, 2);
        assert_eq!(summary.source_products.len(), 1);

        let again = ingestor.ingest(&[az("P1", None, 3.0, None)]).unwrap();
        assert_eq!(again.source_products, summary.source_products);

        let products = store
            .find_unlinked(EntityKind::Product, &UnlinkedFilter::default())
            .unwrap();
        assert_eq!(products.len(), 1);
        let markets = store
            .find_unlinked(EntityKind::Market, &UnlinkedFilter::default())
            .unwrap();
        assert_eq!(markets.len(), 1);
        assert!(markets[0].parent_id.is_some());
        let stages = store
            .find_unlinked(EntityKind::PriceStage, &UnlinkedFilter::default())
            .unwrap();
        assert_eq!(stages[0].external_code, "topdan");
    }

    #[test]
    fn test_bounds_are_sanitized() {
        let store = InMemoryCatalogStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()));
        let summary = ingestor
            .ingest(&[az("P1", Some(5.0), 3.0, None), az("P1", Some(1.0), 2.0, Some(1.5))])
            .unwrap();
        let observations = store
            .observations_for_source_products(&summary.source_products)
            .unwrap();
        assert_eq!(
            (observations[0].value_low, observations[0].value_high),
            (3.0, 3.0)
        );
        assert_eq!(
            (observations[1].value_low, observations[1].value_high),
            (1.0, 2.0)
        );
    }

    #[test]
    fn test_invalid_prices_are_skipped() {
        let store = InMemoryCatalogStore::new();
        let summary = Ingestor::new(Arc::new(store.clone()))
            .ingest(&[az("P1", None, f64::NAN, None), az("P2", None, -1.0, None)])
            .unwrap();
        assert_eq!(summary.observations, 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.observation_count(), 0);
    }

    #[test]
    fn test_same_market_code_in_two_countries() {
        let store = InMemoryCatalogStore::new();
        Ingestor::new(Arc::new(store.clone()))
            .ingest(&[fpma("M1", "KE"), fpma("M1", "UG")])
            .unwrap();
        let markets = store
            .find_unlinked(EntityKind::Market, &UnlinkedFilter::default())
            .unwrap();
        assert_eq!(markets.len(), 2);
    }

    #[test]
    fn test_canonical_reference_prelinks_product() {
        let store = InMemoryCatalogStore::new();
        let product = store
            .create_product(&NewCanonicalProduct {
                name: "Potato".to_string(),
                ..Default::default()
            })
            .unwrap();
        let mut record = az("P1", None, 1.0, None);
        if let SourceRecord::Az(az) = &mut record {
            az.canonical_product_id = Some(product.id);
        }
        let summary = Ingestor::new(Arc::new(store.clone())).ingest(&[record]).unwrap();
        let entity = store
            .get_source_entity(summary.source_products[0])
            .unwrap()
            .unwrap();
        assert_eq!(entity.canonical_id, Some(product.id));
        assert!(!entity.is_manual);
    }
}
