//! In-memory implementation of `CatalogStore` for tests and dry runs.
//!
//! All state sits behind one mutex. Aggregate sets are double-buffered: the
//! replacement set is staged and validated off to the side, then swapped in
//! with a single pointer write.

use super::models::*;
use super::trait_def::{CatalogStore, StageLink};
use crate::conversion::{normalize_currency_code, normalize_unit_code, validate_rate, RateTable};
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    next_id: i64,
    countries: BTreeMap<i64, CanonicalCountry>,
    markets: BTreeMap<i64, CanonicalMarket>,
    products: BTreeMap<i64, CanonicalProduct>,
    varieties: BTreeMap<i64, CanonicalVariety>,
    price_stages: BTreeMap<i64, CanonicalPriceStage>,
    source_entities: BTreeMap<i64, SourceEntity>,
    observations: Vec<RawObservation>,
    aggregates: HashMap<i64, Arc<Vec<AggregateRecord>>>,
    currency_rates: BTreeMap<String, f64>,
    unit_rates: BTreeMap<String, (f64, String)>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn exists(&self, kind: EntityKind, id: i64) -> bool {
        match kind {
            EntityKind::Product => self.products.contains_key(&id),
            EntityKind::Variety => self.varieties.contains_key(&id),
            EntityKind::Market => self.markets.contains_key(&id),
            EntityKind::Country => self.countries.contains_key(&id),
            EntityKind::PriceStage => self.price_stages.contains_key(&id),
        }
    }

    fn dependents(&self, kind: EntityKind, id: i64) -> usize {
        let linked = self
            .source_entities
            .values()
            .filter(|e| e.kind == kind.source_entity_kind())
            .filter(|e| match kind {
                EntityKind::Variety => e.variety_id == Some(id),
                _ => e.canonical_id == Some(id),
            })
            .count();
        let owned = match kind {
            EntityKind::Product => {
                self.varieties.values().filter(|v| v.product_id == id).count()
                    + self.aggregates.get(&id).map_or(0, |set| set.len())
            }
            EntityKind::Country => self.markets.values().filter(|m| m.country_id == id).count(),
            _ => 0,
        };
        linked + owned
    }
}

/// In-memory catalog store with the same semantics as the SQLite one.
#[derive(Clone, Default)]
pub struct InMemoryCatalogStore {
    state: Arc<Mutex<State>>,
    failing_replacements: Arc<AtomicUsize>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `replace_aggregates` fail before the swap.
    pub fn fail_next_replacements(&self, times: usize) {
        self.failing_replacements.store(times, Ordering::SeqCst);
    }

    pub fn observation_count(&self) -> usize {
        self.state.lock().unwrap().observations.len()
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn create_country(&self, iso_code: &str, name: &str) -> Result<CanonicalCountry> {
        let mut state = self.state.lock().unwrap();
        let iso_code = iso_code.trim().to_uppercase();
        if state.countries.values().any(|c| c.iso_code == iso_code) {
            bail!("Country {} already exists", iso_code);
        }
        let country = CanonicalCountry {
            id: state.next_id(),
            iso_code,
            name: name.to_string(),
        };
        state.countries.insert(country.id, country.clone());
        Ok(country)
    }

    fn create_market(
        &self,
        country_id: i64,
        name: &str,
        market_type: Option<&str>,
    ) -> Result<CanonicalMarket> {
        let mut state = self.state.lock().unwrap();
        if !state.countries.contains_key(&country_id) {
            bail!("Country {} does not exist", country_id);
        }
        if state
            .markets
            .values()
            .any(|m| m.country_id == country_id && m.name == name)
        {
            bail!("Market '{}' already exists in country {}", name, country_id);
        }
        let market = CanonicalMarket {
            id: state.next_id(),
            country_id,
            name: name.to_string(),
            market_type: market_type.map(str::to_string),
        };
        state.markets.insert(market.id, market.clone());
        Ok(market)
    }

    fn create_product(&self, product: &NewCanonicalProduct) -> Result<CanonicalProduct> {
        let mut state = self.state.lock().unwrap();
        if state.products.values().any(|p| p.name == product.name) {
            bail!("Product '{}' already exists", product.name);
        }
        let created = CanonicalProduct {
            id: state.next_id(),
            name: product.name.clone(),
            local_name: product.local_name.clone(),
            category: product.category.clone(),
            default_unit: product.default_unit.clone(),
        };
        state.products.insert(created.id, created.clone());
        Ok(created)
    }

    fn create_variety(&self, product_id: i64, name: &str) -> Result<CanonicalVariety> {
        let mut state = self.state.lock().unwrap();
        if !state.products.contains_key(&product_id) {
            bail!("Product {} does not exist", product_id);
        }
        if state
            .varieties
            .values()
            .any(|v| v.product_id == product_id && v.name == name)
        {
            bail!("Variety '{}' already exists in product {}", name, product_id);
        }
        let variety = CanonicalVariety {
            id: state.next_id(),
            product_id,
            name: name.to_string(),
        };
        state.varieties.insert(variety.id, variety.clone());
        Ok(variety)
    }

    fn create_price_stage(&self, code: &str, name: &str) -> Result<CanonicalPriceStage> {
        let mut state = self.state.lock().unwrap();
        if state.price_stages.values().any(|s| s.code == code) {
            bail!("Price stage {} already exists", code);
        }
        let stage = CanonicalPriceStage {
            id: state.next_id(),
            code: code.to_string(),
            name: name.to_string(),
        };
        state.price_stages.insert(stage.id, stage.clone());
        Ok(stage)
    }

    fn get_product(&self, id: i64) -> Result<Option<CanonicalProduct>> {
        Ok(self.state.lock().unwrap().products.get(&id).cloned())
    }

    fn list_products(&self) -> Result<Vec<CanonicalProduct>> {
        Ok(self.state.lock().unwrap().products.values().cloned().collect())
    }

    fn canonical_exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        Ok(self.state.lock().unwrap().exists(kind, id))
    }

    fn canonical_parent(&self, kind: EntityKind, id: i64) -> Result<Option<i64>> {
        let state = self.state.lock().unwrap();
        Ok(match kind {
            EntityKind::Variety => state.varieties.get(&id).map(|v| v.product_id),
            EntityKind::Market => state.markets.get(&id).map(|m| m.country_id),
            _ => None,
        })
    }

    fn list_canonical(&self, kind: EntityKind) -> Result<Vec<CanonicalEntity>> {
        let state = self.state.lock().unwrap();
        let entity = |id: i64, names: Vec<String>, parent_id: Option<i64>| CanonicalEntity {
            id,
            kind,
            names,
            parent_id,
        };
        Ok(match kind {
            EntityKind::Product => state
                .products
                .values()
                .map(|p| {
                    let mut names = vec![p.name.clone()];
                    names.extend(p.local_name.clone());
                    entity(p.id, names, None)
                })
                .collect(),
            EntityKind::Variety => state
                .varieties
                .values()
                .map(|v| entity(v.id, vec![v.name.clone()], Some(v.product_id)))
                .collect(),
            EntityKind::Market => state
                .markets
                .values()
                .map(|m| entity(m.id, vec![m.name.clone()], Some(m.country_id)))
                .collect(),
            EntityKind::Country => state
                .countries
                .values()
                .map(|c| entity(c.id, vec![c.name.clone(), c.iso_code.clone()], None))
                .collect(),
            EntityKind::PriceStage => state
                .price_stages
                .values()
                .map(|s| entity(s.id, vec![s.name.clone(), s.code.clone()], None))
                .collect(),
        })
    }

    fn count_dependents(&self, kind: EntityKind, id: i64) -> Result<usize> {
        Ok(self.state.lock().unwrap().dependents(kind, id))
    }

    fn delete_canonical(&self, kind: EntityKind, id: i64) -> Result<DeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        if !state.exists(kind, id) {
            return Ok(DeleteOutcome::NotFound);
        }
        let dependents = state.dependents(kind, id);
        if dependents > 0 {
            return Ok(DeleteOutcome::HasDependents(dependents));
        }
        match kind {
            EntityKind::Product => {
                state.products.remove(&id);
            }
            EntityKind::Variety => {
                state.varieties.remove(&id);
            }
            EntityKind::Market => {
                state.markets.remove(&id);
            }
            EntityKind::Country => {
                state.countries.remove(&id);
            }
            EntityKind::PriceStage => {
                state.price_stages.remove(&id);
            }
        }
        Ok(DeleteOutcome::Deleted)
    }

    fn register_source_entity(&self, entity: &NewSourceEntity) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.source_entities.values_mut().find(|e| {
            e.kind == entity.kind
                && e.source == entity.source
                && e.external_code == entity.external_code
        }) {
            existing.name = entity.name.clone();
            if entity.local_name.is_some() {
                existing.local_name = entity.local_name.clone();
            }
            if entity.parent_id.is_some() {
                existing.parent_id = entity.parent_id;
            }
            return Ok(existing.id);
        }
        let id = state.next_id();
        state.source_entities.insert(
            id,
            SourceEntity {
                id,
                kind: entity.kind,
                source: entity.source,
                external_code: entity.external_code.clone(),
                name: entity.name.clone(),
                local_name: entity.local_name.clone(),
                parent_id: entity.parent_id,
                canonical_id: None,
                match_score: None,
                is_manual: false,
                variety_id: None,
                variety_score: None,
                variety_is_manual: false,
            },
        );
        Ok(id)
    }

    fn get_source_entity(&self, id: i64) -> Result<Option<SourceEntity>> {
        Ok(self.state.lock().unwrap().source_entities.get(&id).cloned())
    }

    fn find_unlinked(
        &self,
        kind: EntityKind,
        filter: &UnlinkedFilter,
    ) -> Result<Vec<SourceEntity>> {
        let state = self.state.lock().unwrap();
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(state
            .source_entities
            .values()
            .filter(|e| e.kind == kind.source_entity_kind())
            .filter(|e| match kind {
                EntityKind::Variety => {
                    e.canonical_id.is_some()
                        && e.variety_id.is_none()
                        && (filter.include_manual || !e.variety_is_manual)
                }
                _ => e.canonical_id.is_none() && (filter.include_manual || !e.is_manual),
            })
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    fn set_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: Option<f64>,
        is_manual: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let variety_parent = match (kind, canonical_id) {
            (EntityKind::Variety, Some(variety_id)) => {
                Some(state.varieties.get(&variety_id).map(|v| v.product_id))
            }
            _ => None,
        };
        let Some(entity) = state.source_entities.get_mut(&source_id) else {
            return Ok(false);
        };
        if entity.kind != kind.source_entity_kind() {
            return Ok(false);
        }
        match kind {
            EntityKind::Variety => {
                if let Some(parent) = variety_parent {
                    if parent.is_none() || parent != entity.canonical_id {
                        return Ok(false);
                    }
                }
                entity.variety_id = canonical_id;
                entity.variety_score = score;
                entity.variety_is_manual = is_manual;
            }
            _ => {
                if kind == EntityKind::Product && entity.canonical_id != canonical_id {
                    entity.variety_id = None;
                    entity.variety_score = None;
                    entity.variety_is_manual = false;
                }
                entity.canonical_id = canonical_id;
                entity.match_score = score;
                entity.is_manual = is_manual;
            }
        }
        Ok(true)
    }

    fn try_auto_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: f64,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let variety_parent = match (kind, canonical_id) {
            (EntityKind::Variety, Some(variety_id)) => {
                Some(state.varieties.get(&variety_id).map(|v| v.product_id))
            }
            _ => None,
        };
        let Some(entity) = state.source_entities.get_mut(&source_id) else {
            return Ok(false);
        };
        if entity.kind != kind.source_entity_kind() {
            return Ok(false);
        }
        match kind {
            EntityKind::Variety => {
                if entity.variety_is_manual || entity.variety_id.is_some() {
                    return Ok(false);
                }
                if let Some(parent) = variety_parent {
                    if parent.is_none() || parent != entity.canonical_id {
                        return Ok(false);
                    }
                }
                if canonical_id.is_none() && entity.variety_score == Some(score) {
                    return Ok(false);
                }
                entity.variety_id = canonical_id;
                entity.variety_score = Some(score);
            }
            _ => {
                if entity.is_manual || entity.canonical_id.is_some() {
                    return Ok(false);
                }
                if canonical_id.is_none() && entity.match_score == Some(score) {
                    return Ok(false);
                }
                entity.canonical_id = canonical_id;
                entity.match_score = Some(score);
            }
        }
        Ok(true)
    }

    fn source_products_for_canonical(&self, product_id: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let varieties: HashSet<i64> = state
            .varieties
            .values()
            .filter(|v| v.product_id == product_id)
            .map(|v| v.id)
            .collect();
        Ok(state
            .source_entities
            .values()
            .filter(|e| e.kind == EntityKind::Product)
            .filter(|e| {
                e.canonical_id == Some(product_id)
                    || e.variety_id.is_some_and(|v| varieties.contains(&v))
            })
            .map(|e| e.id)
            .collect())
    }

    fn canonical_products_for_sources(&self, source_ids: &[i64]) -> Result<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut products: Vec<i64> = source_ids
            .iter()
            .filter_map(|id| state.source_entities.get(id))
            .filter(|e| e.kind == EntityKind::Product)
            .filter_map(|e| e.canonical_id)
            .collect();
        products.sort_unstable();
        products.dedup();
        Ok(products)
    }

    fn aggregation_candidate_ids(&self) -> Result<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut products: Vec<i64> = state
            .source_entities
            .values()
            .filter(|e| e.kind == EntityKind::Product)
            .filter_map(|e| e.canonical_id)
            .chain(state.aggregates.keys().copied())
            .collect();
        products.sort_unstable();
        products.dedup();
        Ok(products)
    }

    fn price_stage_links(&self) -> Result<Vec<StageLink>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .source_entities
            .values()
            .filter(|e| e.kind == EntityKind::PriceStage)
            .filter_map(|e| {
                let stage = state.price_stages.get(&e.canonical_id?)?;
                Some((e.source, e.external_code.clone(), stage.code.clone()))
            })
            .collect())
    }

    fn market_type_hints(&self, market_refs: &[i64]) -> Result<HashMap<i64, String>> {
        let state = self.state.lock().unwrap();
        Ok(market_refs
            .iter()
            .filter_map(|id| {
                let entity = state.source_entities.get(id)?;
                if entity.kind != EntityKind::Market {
                    return None;
                }
                let market = state.markets.get(&entity.canonical_id?)?;
                Some((*id, market.market_type.clone()?))
            })
            .collect())
    }

    fn insert_observations(&self, observations: &[NewRawObservation]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(orphan) = observations.iter().find(|o| {
            !state
                .source_entities
                .get(&o.source_product_id)
                .is_some_and(|e| e.kind == EntityKind::Product)
        }) {
            bail!(
                "Observation references unknown source product {}",
                orphan.source_product_id
            );
        }
        for obs in observations {
            let id = state.next_id();
            state.observations.push(RawObservation {
                id,
                source: obs.source,
                source_product_id: obs.source_product_id,
                canonical_product_ref: obs.canonical_product_ref,
                market_ref: obs.market_ref,
                price_stage: obs.price_stage.clone(),
                period_date: obs.period_date,
                value_low: obs.value_low,
                value_avg: obs.value_avg,
                value_high: obs.value_high,
                currency: obs.currency.clone(),
                unit: obs.unit.clone(),
            });
        }
        Ok(observations.len())
    }

    fn observations_for_source_products(
        &self,
        source_ids: &[i64],
    ) -> Result<Vec<RawObservation>> {
        let state = self.state.lock().unwrap();
        let wanted: HashSet<i64> = source_ids.iter().copied().collect();
        let mut observations: Vec<RawObservation> = state
            .observations
            .iter()
            .filter(|o| wanted.contains(&o.source_product_id))
            .cloned()
            .collect();
        observations.sort_by(|a, b| (a.period_date, a.id).cmp(&(b.period_date, b.id)));
        Ok(observations)
    }

    fn replace_aggregates(&self, product_id: i64, records: &[AggregateRecord]) -> Result<()> {
        // Stage the new set before touching the live one
        let mut staged = records.to_vec();
        let mut seen = HashSet::new();
        for record in &staged {
            if record.canonical_product_id != product_id {
                bail!(
                    "Aggregate for product {} passed to the replacement of product {}",
                    record.canonical_product_id,
                    product_id
                );
            }
            if !seen.insert(record.key()) {
                bail!("Duplicate aggregate key {:?}", record.key());
            }
        }
        AggregateRecord::sort(&mut staged);

        let pending_failures = self.failing_replacements.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_replacements
                .store(pending_failures - 1, Ordering::SeqCst);
            bail!("Injected failure replacing aggregates of product {}", product_id);
        }

        let mut state = self.state.lock().unwrap();
        if staged.is_empty() {
            state.aggregates.remove(&product_id);
        } else {
            state.aggregates.insert(product_id, Arc::new(staged));
        }
        Ok(())
    }

    fn aggregates_for_product(&self, product_id: i64) -> Result<Vec<AggregateRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .aggregates
            .get(&product_id)
            .map(|set| set.as_ref().clone())
            .unwrap_or_default())
    }

    fn upsert_currency_rate(&self, code: &str, rate_to_base: f64) -> Result<()> {
        validate_rate(code, rate_to_base)?;
        self.state
            .lock()
            .unwrap()
            .currency_rates
            .insert(normalize_currency_code(code), rate_to_base);
        Ok(())
    }

    fn upsert_unit_rate(&self, code: &str, conversion_rate: f64, base_unit: &str) -> Result<()> {
        validate_rate(code, conversion_rate)?;
        self.state.lock().unwrap().unit_rates.insert(
            normalize_unit_code(code),
            (conversion_rate, normalize_unit_code(base_unit)),
        );
        Ok(())
    }

    fn load_rate_table(&self) -> Result<RateTable> {
        let state = self.state.lock().unwrap();
        let mut table = RateTable::new();
        for (code, rate) in &state.currency_rates {
            table.set_currency(code, *rate)?;
        }
        for (code, (rate, base_unit)) in &state.unit_rates {
            table.set_unit(code, *rate, base_unit)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(product_id: i64, week: u32) -> AggregateRecord {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        AggregateRecord {
            canonical_product_id: product_id,
            market_type_code: "WHOLESALE".to_string(),
            period_type: PeriodType::Weekly,
            period: Some(week),
            year: 2024,
            avg_price: 1.0,
            min_price: 1.0,
            max_price: 1.0,
            sample_count: 1,
            start_date: date,
            end_date: date,
            currency: "EUR".to_string(),
            unit: "kg".to_string(),
        }
    }

    #[test]
    fn test_injected_failure_keeps_previous_set() {
        let store = InMemoryCatalogStore::new();
        store.replace_aggregates(7, &[record(7, 1)]).unwrap();

        store.fail_next_replacements(1);
        assert!(store.replace_aggregates(7, &[record(7, 2), record(7, 3)]).is_err());
        assert_eq!(store.aggregates_for_product(7).unwrap(), vec![record(7, 1)]);

        store.replace_aggregates(7, &[record(7, 2)]).unwrap();
        assert_eq!(store.aggregates_for_product(7).unwrap(), vec![record(7, 2)]);
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let store = InMemoryCatalogStore::new();
        assert!(store.replace_aggregates(1, &[record(1, 4), record(1, 4)]).is_err());
        assert!(store.aggregates_for_product(1).unwrap().is_empty());
    }

    #[test]
    fn test_observations_require_registered_product() {
        let store = InMemoryCatalogStore::new();
        let obs = NewRawObservation {
            source: SourceKind::Eu,
            source_product_id: 99,
            canonical_product_ref: None,
            market_ref: None,
            price_stage: "retail".to_string(),
            period_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            value_low: 1.0,
            value_avg: 1.0,
            value_high: 1.0,
            currency: "EUR".to_string(),
            unit: "kg".to_string(),
        };
        assert!(store.insert_observations(&[obs]).is_err());
        assert_eq!(store.observation_count(), 0);
    }

    #[test]
    fn test_manual_unlink_hides_entity_from_default_listing() {
        let store = InMemoryCatalogStore::new();
        let id = store
            .register_source_entity(&NewSourceEntity {
                kind: EntityKind::Market,
                source: SourceKind::Fpma,
                external_code: "M1".to_string(),
                name: "Ganja".to_string(),
                local_name: None,
                parent_id: None,
            })
            .unwrap();
        assert_eq!(
            store
                .find_unlinked(EntityKind::Market, &UnlinkedFilter::default())
                .unwrap()
                .len(),
            1
        );

        store.set_link(EntityKind::Market, id, None, None, true).unwrap();
        assert!(store
            .find_unlinked(EntityKind::Market, &UnlinkedFilter::default())
            .unwrap()
            .is_empty());
        let with_manual = UnlinkedFilter {
            include_manual: true,
            ..Default::default()
        };
        assert_eq!(store.find_unlinked(EntityKind::Market, &with_manual).unwrap().len(), 1);
    }
}
