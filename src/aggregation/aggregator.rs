use super::period::{calendar_bounds, PeriodKey};
use crate::catalog_store::{AggregateRecord, CatalogStore, EntityKind, PeriodType, RawObservation};
use crate::conversion::{convert, normalize_currency_code, normalize_unit_code, RateTable};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::price_stage::StageResolver;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeSummary {
    /// Aggregate records written across all processed products.
    pub total: usize,
    pub products_processed: usize,
    /// Products whose recompute gave up; their previous aggregates are intact.
    #[serde(default)]
    pub failed: Vec<i64>,
}

/// One observation reduced to what the statistics need, in the group's
/// currency and unit.
#[derive(Clone, Copy, Debug)]
struct PricePoint {
    date: NaiveDate,
    low: f64,
    avg: f64,
    high: f64,
}

/// Observations of one market type, converted to its dominant currency/unit.
struct MarketTypeSeries {
    code: String,
    currency: String,
    unit: String,
    points: Vec<PricePoint>,
}

/// Rolls raw observations up into weekly, monthly and annual aggregates.
pub struct PeriodAggregator {
    store: Arc<dyn CatalogStore>,
    max_attempts: u32,
}

impl PeriodAggregator {
    pub fn new(store: Arc<dyn CatalogStore>, max_attempts: u32) -> Self {
        PeriodAggregator {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build the full aggregate set of one product without writing it.
    /// `None` when no source product is linked to it.
    pub fn compute_for_product(&self, product_id: i64) -> EngineResult<Option<Vec<AggregateRecord>>> {
        let source_ids = self.store.source_products_for_canonical(product_id)?;
        if source_ids.is_empty() {
            return Ok(None);
        }
        let observations = self.store.observations_for_source_products(&source_ids)?;
        let series = self.partition(&observations)?;

        let mut records = Vec::new();
        for series in &series {
            for period_type in [PeriodType::Weekly, PeriodType::Monthly, PeriodType::Annual] {
                records.extend(summarize(product_id, series, period_type));
            }
        }
        AggregateRecord::sort(&mut records);
        Ok(Some(records))
    }

    /// Split observations by market-type code and bring each series to a
    /// single currency and unit.
    fn partition(&self, observations: &[RawObservation]) -> EngineResult<Vec<MarketTypeSeries>> {
        let resolver = StageResolver::new(self.store.price_stage_links()?);
        let mut market_refs: Vec<i64> = observations.iter().filter_map(|o| o.market_ref).collect();
        market_refs.sort_unstable();
        market_refs.dedup();
        let hints = self.store.market_type_hints(&market_refs)?;

        let mut by_code: BTreeMap<String, Vec<&RawObservation>> = BTreeMap::new();
        let mut unresolved = 0usize;
        for obs in observations {
            let code = resolver.resolve(obs.source, &obs.price_stage).or_else(|| {
                obs.market_ref
                    .and_then(|market| hints.get(&market))
                    .map(|hint| hint.trim().to_uppercase())
            });
            match code {
                Some(code) => by_code.entry(code).or_default().push(obs),
                None => unresolved += 1,
            }
        }
        if unresolved > 0 {
            warn!(
                "Skipped {} observation(s) whose price stage maps to no market type",
                unresolved
            );
        }

        let mut rates: Option<RateTable> = None;
        let mut series = Vec::with_capacity(by_code.len());
        for (code, group) in by_code {
            let (currency, unit) = dominant_pair(&group);
            let mut points = Vec::with_capacity(group.len());
            for obs in group {
                let (low, high) = obs.bounds();
                let same_pair = normalize_currency_code(&obs.currency) == currency
                    && normalize_unit_code(&obs.unit) == unit;
                if same_pair {
                    points.push(PricePoint {
                        date: obs.period_date,
                        low,
                        avg: obs.value_avg,
                        high,
                    });
                    continue;
                }

                if rates.is_none() {
                    rates = Some(self.store.load_rate_table()?);
                }
                let Some(table) = rates.as_ref() else {
                    continue;
                };
                let to_series = |value: f64| {
                    convert(value, &obs.currency, &currency, &obs.unit, &unit, table).into_result()
                };
                match (to_series(low), to_series(obs.value_avg), to_series(high)) {
                    (Ok(low), Ok(avg), Ok(high)) => points.push(PricePoint {
                        date: obs.period_date,
                        low,
                        avg,
                        high,
                    }),
                    (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                        warn!(
                            "Skipping observation {} in {} series: {}",
                            obs.id, code, e
                        );
                    }
                }
            }
            if !points.is_empty() {
                series.push(MarketTypeSeries {
                    code,
                    currency,
                    unit,
                    points,
                });
            }
        }
        Ok(series)
    }

    fn recompute_once(&self, product_id: i64) -> EngineResult<usize> {
        let Some(records) = self.compute_for_product(product_id)? else {
            // Aggregates left over from sources that moved elsewhere
            if self.store.aggregates_for_product(product_id)?.is_empty() {
                debug!("Product {} has no linked source products, nothing to do", product_id);
            } else {
                info!("Product {} lost its source products, clearing its aggregates", product_id);
                self.store.replace_aggregates(product_id, &[])?;
            }
            return Ok(0);
        };
        self.store.replace_aggregates(product_id, &records)?;

        for period_type in [PeriodType::Weekly, PeriodType::Monthly, PeriodType::Annual] {
            let count = records.iter().filter(|r| r.period_type == period_type).count();
            metrics::record_aggregates_written(period_type.to_db_str(), count);
        }
        Ok(records.len())
    }

    /// Regenerate every aggregate of one product, retrying the whole unit of
    /// work up to the configured attempt count.
    pub fn recompute_for_product(&self, product_id: i64) -> EngineResult<usize> {
        if !self.store.canonical_exists(EntityKind::Product, product_id)? {
            return Err(EngineError::NotFound {
                kind: EntityKind::Product,
                id: product_id,
            });
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.recompute_once(product_id) {
                Ok(written) => {
                    metrics::record_aggregation_duration("product", started.elapsed());
                    debug!(
                        "Product {}: wrote {} aggregate(s) in {:?}",
                        product_id,
                        written,
                        started.elapsed()
                    );
                    return Ok(written);
                }
                Err(e) if attempt < self.max_attempts => {
                    metrics::record_aggregation_failure("retried");
                    warn!(
                        "Aggregation of product {} failed (attempt {}/{}): {}",
                        product_id, attempt, self.max_attempts, e
                    );
                }
                Err(e) => {
                    metrics::record_aggregation_failure("exhausted");
                    return Err(EngineError::AggregationPartialFailure {
                        product_id,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    pub fn recompute_products(&self, product_ids: &[i64]) -> RecomputeSummary {
        let mut summary = RecomputeSummary::default();
        for &product_id in product_ids {
            match self.recompute_for_product(product_id) {
                Ok(written) => {
                    summary.total += written;
                    summary.products_processed += 1;
                }
                Err(e) => {
                    error!("Giving up on aggregates of product {}: {}", product_id, e);
                    summary.failed.push(product_id);
                }
            }
        }
        summary
    }

    /// Recompute every canonical product with a linked source product or
    /// stored aggregates. One product failing does not stop the others.
    pub fn recompute_all(&self) -> EngineResult<RecomputeSummary> {
        let started = Instant::now();
        let product_ids = self.store.aggregation_candidate_ids()?;
        info!("Recomputing aggregates of {} product(s)", product_ids.len());

        let summary = self.recompute_products(&product_ids);
        metrics::record_aggregation_duration("all", started.elapsed());
        info!(
            "Recomputed {} aggregate(s) for {} product(s) in {:?}, {} failed",
            summary.total,
            summary.products_processed,
            started.elapsed(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Recompute every canonical product affected by the given source products.
    pub fn recompute_for_source_products(&self, source_ids: &[i64]) -> EngineResult<RecomputeSummary> {
        let product_ids = self.store.canonical_products_for_sources(source_ids)?;
        debug!(
            "{} source product(s) affect {} canonical product(s)",
            source_ids.len(),
            product_ids.len()
        );
        Ok(self.recompute_products(&product_ids))
    }
}

/// Most frequent `(currency, unit)` pair of a group; ties go to the
/// lexicographically smallest pair.
fn dominant_pair(group: &[&RawObservation]) -> (String, String) {
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    for obs in group {
        *counts
            .entry((normalize_currency_code(&obs.currency), normalize_unit_code(&obs.unit)))
            .or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a_pair, a_count), (b_pair, b_count)| {
            a_count.cmp(b_count).then_with(|| b_pair.cmp(a_pair))
        })
        .map(|(pair, _)| pair)
        .unwrap_or_default()
}

fn summarize(
    product_id: i64,
    series: &MarketTypeSeries,
    period_type: PeriodType,
) -> Vec<AggregateRecord> {
    let mut groups: BTreeMap<PeriodKey, Vec<PricePoint>> = BTreeMap::new();
    for point in &series.points {
        groups
            .entry(PeriodKey::of(period_type, point.date))
            .or_default()
            .push(*point);
    }

    groups
        .into_iter()
        .filter(|(_, points)| !points.is_empty())
        .map(|(key, points)| {
            let n = points.len();
            let min_price = points.iter().map(|p| p.low).fold(f64::INFINITY, f64::min);
            let max_price = points.iter().map(|p| p.high).fold(f64::NEG_INFINITY, f64::max);
            // Unweighted mean of the per-observation averages
            let mean = points.iter().map(|p| p.avg).sum::<f64>() / n as f64;
            let observed_start = points.iter().map(|p| p.date).min().unwrap_or(points[0].date);
            let observed_end = points.iter().map(|p| p.date).max().unwrap_or(points[0].date);
            let (start_date, end_date) = calendar_bounds(period_type, points[0].date)
                .unwrap_or((observed_start, observed_end));

            AggregateRecord {
                canonical_product_id: product_id,
                market_type_code: series.code.clone(),
                period_type,
                period: key.period,
                year: key.year,
                // Summation rounding must not push the mean outside the bounds
                avg_price: mean.clamp(min_price, max_price),
                min_price,
                max_price,
                sample_count: n as u32,
                start_date,
                end_date,
                currency: series.currency.clone(),
                unit: series.unit.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::{
        InMemoryCatalogStore, NewCanonicalProduct, NewRawObservation, NewSourceEntity, SourceKind,
    };

    struct Fixture {
        store: InMemoryCatalogStore,
        product_id: i64,
        source_product: i64,
    }

    fn fixture() -> Fixture {
        let store = InMemoryCatalogStore::new();
        let product_id = store
            .create_product(&NewCanonicalProduct {
                name: "Potato".to_string(),
                ..Default::default()
            })
            .unwrap()
            .id;
        let source_product = store
            .register_source_entity(&NewSourceEntity {
                kind: EntityKind::Product,
                source: SourceKind::Az,
                external_code: "P1".to_string(),
                name: "Kartof".to_string(),
                local_name: None,
                parent_id: None,
            })
            .unwrap();
        store
            .set_link(EntityKind::Product, source_product, Some(product_id), Some(1.0), true)
            .unwrap();
        Fixture {
            store,
            product_id,
            source_product,
        }
    }

    fn observe(f: &Fixture, date: (i32, u32, u32), low: f64, avg: f64, high: f64, currency: &str, unit: &str) {
        f.store
            .insert_observations(&[NewRawObservation {
                source: SourceKind::Az,
                source_product_id: f.source_product,
                canonical_product_ref: None,
                market_ref: None,
                price_stage: "topdan".to_string(),
                period_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
                value_low: low,
                value_avg: avg,
                value_high: high,
                currency: currency.to_string(),
                unit: unit.to_string(),
            }])
            .unwrap();
    }

    fn aggregator(f: &Fixture) -> PeriodAggregator {
        PeriodAggregator::new(Arc::new(f.store.clone()), DEFAULT_MAX_ATTEMPTS)
    }

    #[test]
    fn test_unlinked_product_is_a_noop() {
        let store = InMemoryCatalogStore::new();
        let id = store
            .create_product(&NewCanonicalProduct {
                name: "Lonely".to_string(),
                ..Default::default()
            })
            .unwrap()
            .id;
        let aggregator = PeriodAggregator::new(Arc::new(store), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(aggregator.recompute_for_product(id).unwrap(), 0);
    }

    #[test]
    fn test_product_without_sources_loses_leftover_aggregates() {
        let f = fixture();
        observe(&f, (2024, 5, 1), 1.0, 2.0, 3.0, "AZN", "kg");
        aggregator(&f).recompute_for_product(f.product_id).unwrap();
        assert_eq!(f.store.aggregates_for_product(f.product_id).unwrap().len(), 3);

        f.store
            .set_link(EntityKind::Product, f.source_product, None, None, true)
            .unwrap();
        let summary = aggregator(&f).recompute_all().unwrap();
        assert_eq!(summary.products_processed, 1);
        assert_eq!(summary.total, 0);
        assert!(f.store.aggregates_for_product(f.product_id).unwrap().is_empty());
        assert_eq!(f.store.count_dependents(EntityKind::Product, f.product_id).unwrap(), 0);
    }

    #[test]
    fn test_unknown_product_is_not_found() {
        let f = fixture();
        assert!(matches!(
            aggregator(&f).recompute_for_product(f.product_id + 1000),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_mixed_units_convert_into_dominant_pair() {
        let f = fixture();
        f.store.upsert_currency_rate("AZN", 1.7).unwrap();
        f.store.upsert_unit_rate("kg", 1.0, "kg").unwrap();
        f.store.upsert_unit_rate("t", 0.001, "kg").unwrap();
        observe(&f, (2024, 3, 4), 1.0, 1.0, 1.0, "AZN", "kg");
        observe(&f, (2024, 3, 5), 3.0, 3.0, 3.0, "AZN", "kg");
        observe(&f, (2024, 3, 6), 2000.0, 2000.0, 2000.0, "AZN", "t");

        aggregator(&f).recompute_for_product(f.product_id).unwrap();
        let weekly: Vec<_> = f
            .store
            .aggregates_for_product(f.product_id)
            .unwrap()
            .into_iter()
            .filter(|r| r.period_type == PeriodType::Weekly)
            .collect();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].unit, "kg");
        assert_eq!(weekly[0].sample_count, 3);
        assert!((weekly[0].avg_price - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unconvertible_minority_is_skipped() {
        let f = fixture();
        observe(&f, (2024, 3, 4), 1.0, 1.0, 1.0, "AZN", "kg");
        observe(&f, (2024, 3, 5), 3.0, 3.0, 3.0, "AZN", "kg");
        observe(&f, (2024, 3, 6), 9.0, 9.0, 9.0, "USD", "kg");

        aggregator(&f).recompute_for_product(f.product_id).unwrap();
        let records = f.store.aggregates_for_product(f.product_id).unwrap();
        assert!(records.iter().all(|r| r.sample_count == 2 && r.currency == "AZN"));
    }

    #[test]
    fn test_retries_then_succeeds() {
        let f = fixture();
        observe(&f, (2024, 5, 1), 1.0, 2.0, 3.0, "AZN", "kg");
        f.store.fail_next_replacements(2);
        assert_eq!(aggregator(&f).recompute_for_product(f.product_id).unwrap(), 3);
    }

    #[test]
    fn test_exhausted_retries_keep_previous_set() {
        let f = fixture();
        observe(&f, (2024, 5, 1), 1.0, 2.0, 3.0, "AZN", "kg");
        aggregator(&f).recompute_for_product(f.product_id).unwrap();
        let before = f.store.aggregates_for_product(f.product_id).unwrap();

        observe(&f, (2024, 6, 1), 1.0, 2.0, 3.0, "AZN", "kg");
        f.store.fail_next_replacements(DEFAULT_MAX_ATTEMPTS as usize);
        let err = aggregator(&f).recompute_for_product(f.product_id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AggregationPartialFailure { attempts: 3, .. }
        ));
        assert_eq!(f.store.aggregates_for_product(f.product_id).unwrap(), before);
    }

    #[test]
    fn test_failure_is_isolated_per_product() {
        let f = fixture();
        observe(&f, (2024, 5, 1), 1.0, 2.0, 3.0, "AZN", "kg");
        let other = f
            .store
            .create_product(&NewCanonicalProduct {
                name: "Onion".to_string(),
                ..Default::default()
            })
            .unwrap()
            .id;
        let other_source = f
            .store
            .register_source_entity(&NewSourceEntity {
                kind: EntityKind::Product,
                source: SourceKind::Eu,
                external_code: "ONION".to_string(),
                name: "Onion".to_string(),
                local_name: None,
                parent_id: None,
            })
            .unwrap();
        f.store
            .set_link(EntityKind::Product, other_source, Some(other), Some(1.0), false)
            .unwrap();

        // Fails every attempt of the first product processed only
        f.store.fail_next_replacements(DEFAULT_MAX_ATTEMPTS as usize);
        let summary = aggregator(&f).recompute_all().unwrap();
        assert_eq!(summary.failed, vec![f.product_id]);
        assert_eq!(summary.products_processed, 1);
    }

    #[test]
    fn test_dominant_pair_tie_breaks_lexicographically() {
        let mk = |currency: &str| RawObservation {
            id: 1,
            source: SourceKind::Fpma,
            source_product_id: 1,
            canonical_product_ref: None,
            market_ref: None,
            price_stage: "retail".to_string(),
            period_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            value_low: 1.0,
            value_avg: 1.0,
            value_high: 1.0,
            currency: currency.to_string(),
            unit: "kg".to_string(),
        };
        let usd = mk("usd");
        let eur = mk("EUR");
        assert_eq!(
            dominant_pair(&[&usd, &eur]),
            ("EUR".to_string(), "kg".to_string())
        );
        let usd2 = mk("USD");
        assert_eq!(
            dominant_pair(&[&usd, &eur, &usd2]),
            ("USD".to_string(), "kg".to_string())
        );
    }
}
