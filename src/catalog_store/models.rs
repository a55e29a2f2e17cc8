//! Canonical identity graph, source entities and derived price records.
//!
//! Canonical records are long-lived reference data. Source entities are the
//! per-feed products, markets, countries and price stages that point at
//! (at most) one canonical record each.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Enumerations
// =============================================================================

/// The four upstream feeds the engine understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    /// National ministry feed
    Az,
    /// Regional trade-bloc statistical office
    Eu,
    /// Global food/agriculture statistics body
    Fao,
    /// Global food-price monitoring service
    Fpma,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Az,
        SourceKind::Eu,
        SourceKind::Fao,
        SourceKind::Fpma,
    ];

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "AZ" => Some(SourceKind::Az),
            "EU" => Some(SourceKind::Eu),
            "FAO" => Some(SourceKind::Fao),
            "FPMA" => Some(SourceKind::Fpma),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            SourceKind::Az => "AZ",
            SourceKind::Eu => "EU",
            SourceKind::Fao => "FAO",
            SourceKind::Fpma => "FPMA",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

/// Kinds of canonical entity. Each kind has its own link/unlink/list surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Variety,
    Market,
    Country,
    PriceStage,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Product,
        EntityKind::Variety,
        EntityKind::Market,
        EntityKind::Country,
        EntityKind::PriceStage,
    ];

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "product" => Some(EntityKind::Product),
            "variety" => Some(EntityKind::Variety),
            "market" => Some(EntityKind::Market),
            "country" => Some(EntityKind::Country),
            "price_stage" => Some(EntityKind::PriceStage),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Variety => "variety",
            EntityKind::Market => "market",
            EntityKind::Country => "country",
            EntityKind::PriceStage => "price_stage",
        }
    }

    /// The kind of source entity that carries the link for this canonical kind.
    ///
    /// Varieties are not a source taxonomy of their own: the nested variety
    /// pointer lives on the source product.
    pub fn source_entity_kind(&self) -> EntityKind {
        match self {
            EntityKind::Variety => EntityKind::Product,
            other => *other,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

/// Aggregation granularity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeriodType {
    Weekly,
    Monthly,
    Annual,
}

impl PeriodType {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "WEEKLY" => Some(PeriodType::Weekly),
            "MONTHLY" => Some(PeriodType::Monthly),
            "ANNUAL" => Some(PeriodType::Annual),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            PeriodType::Weekly => "WEEKLY",
            PeriodType::Monthly => "MONTHLY",
            PeriodType::Annual => "ANNUAL",
        }
    }
}

// =============================================================================
// Canonical records
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCountry {
    pub id: i64,
    pub iso_code: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMarket {
    pub id: i64,
    pub country_id: i64,
    pub name: String,
    /// Optional market-type hint (e.g. "WHOLESALE" for a wholesale market).
    pub market_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: i64,
    pub name: String,
    pub local_name: Option<String>,
    pub category: Option<String>,
    pub default_unit: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCanonicalProduct {
    pub name: String,
    pub local_name: Option<String>,
    pub category: Option<String>,
    pub default_unit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVariety {
    pub id: i64,
    pub product_id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPriceStage {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// Kind-agnostic view of a canonical record, used as a match candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalEntity {
    pub id: i64,
    pub kind: EntityKind,
    /// Every display name the record is known by.
    pub names: Vec<String>,
    /// Owning record: the product of a variety, the country of a market.
    pub parent_id: Option<i64>,
}

/// Outcome of a guarded canonical delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    HasDependents(usize),
}

// =============================================================================
// Source entities
// =============================================================================

/// A product, market, country or price stage as one feed names it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub id: i64,
    pub kind: EntityKind,
    pub source: SourceKind,
    pub external_code: String,
    pub name: String,
    pub local_name: Option<String>,
    /// Source-side owner, e.g. the source country of a source market.
    pub parent_id: Option<i64>,
    pub canonical_id: Option<i64>,
    pub match_score: Option<f64>,
    pub is_manual: bool,
    /// Nested variety link, only meaningful for source products.
    pub variety_id: Option<i64>,
    pub variety_score: Option<f64>,
    pub variety_is_manual: bool,
}

impl SourceEntity {
    pub fn display_names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        if let Some(local) = self.local_name.as_deref() {
            if !local.is_empty() && local != self.name {
                names.push(local);
            }
        }
        names
    }

    /// The link pointer that `kind` reads: the nested variety for varieties,
    /// the primary canonical pointer otherwise.
    pub fn link_for(&self, kind: EntityKind) -> (Option<i64>, Option<f64>, bool) {
        match kind {
            EntityKind::Variety => (self.variety_id, self.variety_score, self.variety_is_manual),
            _ => (self.canonical_id, self.match_score, self.is_manual),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSourceEntity {
    pub kind: EntityKind,
    pub source: SourceKind,
    pub external_code: String,
    pub name: String,
    pub local_name: Option<String>,
    pub parent_id: Option<i64>,
}

/// Filter for `find_unlinked`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnlinkedFilter {
    pub source: Option<SourceKind>,
    /// Case-insensitive substring match on the source name.
    pub name_contains: Option<String>,
    /// Also list entities that an operator explicitly left unlinked.
    #[serde(default)]
    pub include_manual: bool,
    pub limit: Option<usize>,
}

impl UnlinkedFilter {
    pub fn matches(&self, entity: &SourceEntity) -> bool {
        if let Some(source) = self.source {
            if entity.source != source {
                return false;
            }
        }
        if let Some(needle) = self.name_contains.as_deref() {
            let needle = needle.to_lowercase();
            let in_name = entity.name.to_lowercase().contains(&needle);
            let in_local = entity
                .local_name
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains(&needle));
            if !in_name && !in_local {
                return false;
            }
        }
        true
    }
}

/// Transient matcher output: the best candidate for one source entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub source_entity_id: i64,
    pub canonical_candidate_id: i64,
    pub score: f64,
    pub is_manual: bool,
}

// =============================================================================
// Observations and aggregates
// =============================================================================

/// One price reading as deposited by ingestion. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub id: i64,
    pub source: SourceKind,
    pub source_product_id: i64,
    pub canonical_product_ref: Option<i64>,
    /// Source market or source country entity the price was observed at.
    pub market_ref: Option<i64>,
    /// Stage as the source spells it; normalized through the stage registry.
    pub price_stage: String,
    pub period_date: NaiveDate,
    pub value_low: f64,
    pub value_avg: f64,
    pub value_high: f64,
    pub currency: String,
    pub unit: String,
}

impl RawObservation {
    /// Low/high bounds widened so that `low <= avg <= high` always holds.
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.value_low.min(self.value_avg),
            self.value_high.max(self.value_avg),
        )
    }
}

/// Observation ready for insertion (ids assigned by the store).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRawObservation {
    pub source: SourceKind,
    pub source_product_id: i64,
    pub canonical_product_ref: Option<i64>,
    pub market_ref: Option<i64>,
    pub price_stage: String,
    pub period_date: NaiveDate,
    pub value_low: f64,
    pub value_avg: f64,
    pub value_high: f64,
    pub currency: String,
    pub unit: String,
}

/// Derived statistical summary; disposable and never hand-edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub canonical_product_id: i64,
    pub market_type_code: String,
    pub period_type: PeriodType,
    /// Week of year or month of year; `None` for annual records.
    pub period: Option<u32>,
    pub year: i32,
    pub avg_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub sample_count: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub currency: String,
    pub unit: String,
}

impl AggregateRecord {
    /// The uniqueness key of the record.
    pub fn key(&self) -> (i64, &str, PeriodType, Option<u32>, i32) {
        (
            self.canonical_product_id,
            self.market_type_code.as_str(),
            self.period_type,
            self.period,
            self.year,
        )
    }

    /// Canonical output order: market type, granularity, then chronological.
    pub fn sort(records: &mut [AggregateRecord]) {
        records.sort_by(|a, b| {
            a.canonical_product_id
                .cmp(&b.canonical_product_id)
                .then_with(|| a.market_type_code.cmp(&b.market_type_code))
                .then_with(|| a.period_type.cmp(&b.period_type))
                .then_with(|| a.year.cmp(&b.year))
                .then_with(|| a.period.cmp(&b.period))
        });
    }
}
