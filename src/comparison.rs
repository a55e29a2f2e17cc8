//! Comparison façade: aggregate series of several products, converted on
//! read into one currency and unit.
//!
//! Missing aggregates and refused conversions are labelled as unavailable
//! data points rather than failing the whole comparison.

use crate::catalog_store::{AggregateRecord, CatalogStore, EntityKind, PeriodType};
use crate::conversion::{convert, RateTable};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DATA_UNAVAILABLE: &str = "data unavailable";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRequest {
    pub product_ids: Vec<i64>,
    pub period_type: PeriodType,
    /// Restrict to one calendar (or ISO week-) year.
    #[serde(default)]
    pub year: Option<i32>,
    /// Restrict to one market type.
    #[serde(default)]
    pub market_type_code: Option<String>,
    pub currency: String,
    pub unit: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointStatus {
    Available,
    Unavailable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonPoint {
    pub year: i32,
    pub period: Option<u32>,
    /// Converted values; `None` when the point is unavailable.
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub sample_count: u32,
    #[serde(flatten)]
    pub status: PointStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSeries {
    pub product_id: i64,
    /// `None` on the placeholder series of a product without aggregates.
    pub market_type_code: Option<String>,
    pub points: Vec<ComparisonPoint>,
    #[serde(flatten)]
    pub status: PointStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub period_type: PeriodType,
    pub currency: String,
    pub unit: String,
    pub series: Vec<ComparisonSeries>,
}

/// Build the comparison. Only unknown product ids are errors.
pub fn compare(store: &dyn CatalogStore, request: &ComparisonRequest) -> EngineResult<Comparison> {
    let rates = store.load_rate_table()?;
    let mut series = Vec::new();

    for &product_id in &request.product_ids {
        if !store.canonical_exists(EntityKind::Product, product_id)? {
            return Err(EngineError::NotFound {
                kind: EntityKind::Product,
                id: product_id,
            });
        }

        let mut by_market_type: BTreeMap<String, Vec<AggregateRecord>> = BTreeMap::new();
        for record in store.aggregates_for_product(product_id)? {
            if record.period_type != request.period_type {
                continue;
            }
            if request.year.is_some_and(|year| record.year != year) {
                continue;
            }
            if let Some(code) = &request.market_type_code {
                if !record.market_type_code.eq_ignore_ascii_case(code) {
                    continue;
                }
            }
            by_market_type
                .entry(record.market_type_code.clone())
                .or_default()
                .push(record);
        }

        if by_market_type.is_empty() {
            series.push(ComparisonSeries {
                product_id,
                market_type_code: None,
                points: Vec::new(),
                status: PointStatus::Unavailable {
                    reason: DATA_UNAVAILABLE.to_string(),
                },
            });
            continue;
        }

        for (code, records) in by_market_type {
            let points: Vec<ComparisonPoint> = records
                .iter()
                .map(|record| to_point(record, request, &rates))
                .collect();
            let status = if points.iter().any(|p| p.status == PointStatus::Available) {
                PointStatus::Available
            } else {
                PointStatus::Unavailable {
                    reason: DATA_UNAVAILABLE.to_string(),
                }
            };
            series.push(ComparisonSeries {
                product_id,
                market_type_code: Some(code),
                points,
                status,
            });
        }
    }

    Ok(Comparison {
        period_type: request.period_type,
        currency: request.currency.clone(),
        unit: request.unit.clone(),
        series,
    })
}

fn to_point(record: &AggregateRecord, request: &ComparisonRequest, rates: &RateTable) -> ComparisonPoint {
    let to_target = |value: f64| {
        convert(
            value,
            &record.currency,
            &request.currency,
            &record.unit,
            &request.unit,
            rates,
        )
    };
    let avg = to_target(record.avg_price);
    let (avg_price, min_price, max_price, status) = match avg.warning {
        None => (
            Some(avg.value),
            Some(to_target(record.min_price).value),
            Some(to_target(record.max_price).value),
            PointStatus::Available,
        ),
        Some(warning) => (
            None,
            None,
            None,
            PointStatus::Unavailable {
                reason: format!("{}: {}", DATA_UNAVAILABLE, warning),
            },
        ),
    };
    ComparisonPoint {
        year: record.year,
        period: record.period,
        avg_price,
        min_price,
        max_price,
        sample_count: record.sample_count,
        status,
    }
}
