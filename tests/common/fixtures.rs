//! Test fixture creation

#![allow(dead_code)]

use super::constants::*;
use agri_price_engine::catalog_store::{
    CatalogStore, EntityKind, NewCanonicalProduct, NewRawObservation, NewSourceEntity, SourceKind,
    SqliteCatalogStore,
};
use agri_price_engine::{EngineSettings, PriceEngine};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Observation with explicit bounds, in AZN per kg unless changed by the caller.
pub fn observation(
    source_product_id: i64,
    period_date: NaiveDate,
    low: f64,
    avg: f64,
    high: f64,
) -> NewRawObservation {
    NewRawObservation {
        source: SourceKind::Az,
        source_product_id,
        canonical_product_ref: None,
        market_ref: None,
        price_stage: "Retail".to_string(),
        period_date,
        value_low: low,
        value_avg: avg,
        value_high: high,
        currency: "AZN".to_string(),
        unit: "kg".to_string(),
    }
}

/// An engine over a fresh SQLite database. The directory lives as long as
/// the struct.
pub struct TestEngine {
    pub engine: PriceEngine,
    pub store: Arc<SqliteCatalogStore>,
    pub db_path: PathBuf,
    _dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_settings(&EngineSettings::default())
    }

    pub fn with_settings(settings: &EngineSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("prices.db");
        let store = Arc::new(SqliteCatalogStore::new(&db_path).unwrap());
        let engine = PriceEngine::new(store.clone(), settings);
        TestEngine {
            engine,
            store,
            db_path,
            _dir: dir,
        }
    }

    /// A second engine over the same database file, as after a restart.
    pub fn reopen(&self) -> PriceEngine {
        let store = Arc::new(SqliteCatalogStore::new(&self.db_path).unwrap());
        PriceEngine::new(store, &EngineSettings::default())
    }

    pub fn seed_rates(&self) {
        for (code, rate) in CURRENCY_RATES {
            self.engine.upsert_currency_rate(code, *rate).unwrap();
        }
        for (code, rate, base) in UNIT_RATES {
            self.engine.upsert_unit_rate(code, *rate, base).unwrap();
        }
    }

    pub fn create_product(&self, name: &str) -> i64 {
        self.engine
            .create_product(&NewCanonicalProduct {
                name: name.to_string(),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    pub fn register_source(
        &self,
        kind: EntityKind,
        source: SourceKind,
        code: &str,
        name: &str,
        parent_id: Option<i64>,
    ) -> i64 {
        self.store
            .register_source_entity(&NewSourceEntity {
                kind,
                source,
                external_code: code.to_string(),
                name: name.to_string(),
                local_name: None,
                parent_id,
            })
            .unwrap()
    }

    /// Canonical product with one manually linked AZ source product.
    /// Returns `(canonical_id, source_product_id)`.
    pub fn linked_potato(&self) -> (i64, i64) {
        let product = self.create_product(POTATO);
        let source = self.register_source(
            EntityKind::Product,
            SourceKind::Az,
            AZ_POTATO_CODE,
            AZ_POTATO_NAME,
            None,
        );
        self.engine
            .link_entity(EntityKind::Product, source, Some(product))
            .unwrap();
        (product, source)
    }

    pub fn insert(&self, observations: &[NewRawObservation]) {
        self.store.insert_observations(observations).unwrap();
    }
}
