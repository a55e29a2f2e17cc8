//! Per-source record shapes and the shared extraction interface.
//!
//! Each source reports prices with its own field set. The records below mirror
//! those field sets; `ObservationSource` is the one view ingestion needs, and
//! `SourceRecord` is the only place that dispatches on source identity.

use crate::catalog_store::SourceKind;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Source-side product identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProductRef<'a> {
    pub code: &'a str,
    pub name: &'a str,
    pub local_name: Option<&'a str>,
}

/// Source-side country identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountryRef<'a> {
    pub code: &'a str,
    pub name: &'a str,
}

/// Where a price was observed: a named market, or a whole country.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocationRef<'a> {
    Market {
        code: &'a str,
        name: &'a str,
        country: Option<CountryRef<'a>>,
    },
    Country(CountryRef<'a>),
}

/// Common view over one source record.
pub trait ObservationSource {
    fn source(&self) -> SourceKind;
    fn product(&self) -> ProductRef<'_>;
    fn location(&self) -> Option<LocationRef<'_>>;
    /// Price stage exactly as the source spells it.
    fn price_stage(&self) -> &str;
    fn period_date(&self) -> Option<NaiveDate>;
    /// `(low, avg, high)`; sources that report a single price leave the bounds empty.
    fn values(&self) -> (Option<f64>, f64, Option<f64>);
    fn currency(&self) -> &str;
    fn unit(&self) -> &str;
    /// Canonical product the feed already knows this record belongs to.
    fn canonical_product_ref(&self) -> Option<i64> {
        None
    }
}

fn default_azn() -> String {
    "AZN".to_string()
}

fn default_eur() -> String {
    "EUR".to_string()
}

fn default_kg() -> String {
    "kg".to_string()
}

fn default_100kg() -> String {
    "100kg".to_string()
}

fn default_tonne() -> String {
    "t".to_string()
}

/// National ministry feed: min/avg/max per product, region and stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AzRecord {
    pub product_code: String,
    pub product_name: String,
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    pub price_stage: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub min_price: Option<f64>,
    pub avg_price: f64,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default = "default_azn")]
    pub currency: String,
    #[serde(default = "default_kg")]
    pub unit: String,
    #[serde(default)]
    pub canonical_product_id: Option<i64>,
}

const AZ_COUNTRY: CountryRef<'static> = CountryRef {
    code: "AZ",
    name: "Azerbaijan",
};

impl ObservationSource for AzRecord {
    fn source(&self) -> SourceKind {
        SourceKind::Az
    }

    fn product(&self) -> ProductRef<'_> {
        ProductRef {
            code: &self.product_code,
            name: &self.product_name,
            local_name: self.local_name.as_deref(),
        }
    }

    fn location(&self) -> Option<LocationRef<'_>> {
        match (&self.region_code, &self.region_name) {
            (Some(code), name) => Some(LocationRef::Market {
                code,
                name: name.as_deref().unwrap_or(code),
                country: Some(AZ_COUNTRY),
            }),
            (None, Some(name)) => Some(LocationRef::Market {
                code: name,
                name,
                country: Some(AZ_COUNTRY),
            }),
            (None, None) => Some(LocationRef::Country(AZ_COUNTRY)),
        }
    }

    fn price_stage(&self) -> &str {
        &self.price_stage
    }

    fn period_date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }

    fn values(&self) -> (Option<f64>, f64, Option<f64>) {
        (self.min_price, self.avg_price, self.max_price)
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn canonical_product_ref(&self) -> Option<i64> {
        self.canonical_product_id
    }
}

/// Trade-bloc statistical office: one price per member state, product and
/// price type, for a reference period starting on `period_start`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EuRecord {
    pub product_code: String,
    pub product_label: String,
    pub member_state: String,
    #[serde(default)]
    pub member_state_name: Option<String>,
    pub price_type: String,
    pub period_start: NaiveDate,
    pub price: f64,
    #[serde(default = "default_eur")]
    pub currency: String,
    #[serde(default = "default_100kg")]
    pub unit: String,
}

impl ObservationSource for EuRecord {
    fn source(&self) -> SourceKind {
        SourceKind::Eu
    }

    fn product(&self) -> ProductRef<'_> {
        ProductRef {
            code: &self.product_code,
            name: &self.product_label,
            local_name: None,
        }
    }

    fn location(&self) -> Option<LocationRef<'_>> {
        Some(LocationRef::Country(CountryRef {
            code: &self.member_state,
            name: self.member_state_name.as_deref().unwrap_or(&self.member_state),
        }))
    }

    fn price_stage(&self) -> &str {
        &self.price_type
    }

    fn period_date(&self) -> Option<NaiveDate> {
        Some(self.period_start)
    }

    fn values(&self) -> (Option<f64>, f64, Option<f64>) {
        (None, self.price, None)
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn unit(&self) -> &str {
        &self.unit
    }
}

/// Global statistics body: annual values per area, item and element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaoRecord {
    pub item_code: String,
    pub item: String,
    pub area_code: String,
    pub area: String,
    pub element: String,
    pub year: i32,
    pub value: f64,
    pub currency: String,
    #[serde(default = "default_tonne")]
    pub unit: String,
}

impl ObservationSource for FaoRecord {
    fn source(&self) -> SourceKind {
        SourceKind::Fao
    }

    fn product(&self) -> ProductRef<'_> {
        ProductRef {
            code: &self.item_code,
            name: &self.item,
            local_name: None,
        }
    }

    fn location(&self) -> Option<LocationRef<'_>> {
        Some(LocationRef::Country(CountryRef {
            code: &self.area_code,
            name: &self.area,
        }))
    }

    fn price_stage(&self) -> &str {
        &self.element
    }

    /// Annual figures are dated on the first day of their year.
    fn period_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, 1, 1)
    }

    fn values(&self) -> (Option<f64>, f64, Option<f64>) {
        (None, self.value, None)
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn unit(&self) -> &str {
        &self.unit
    }
}

/// Food-price monitoring service: market-level series per commodity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FpmaRecord {
    pub commodity_code: String,
    pub commodity: String,
    pub market_code: String,
    pub market: String,
    pub country_iso: String,
    pub country_name: String,
    pub price_type: String,
    pub date: NaiveDate,
    pub price: f64,
    pub currency: String,
    #[serde(default = "default_kg")]
    pub unit: String,
}

impl ObservationSource for FpmaRecord {
    fn source(&self) -> SourceKind {
        SourceKind::Fpma
    }

    fn product(&self) -> ProductRef<'_> {
        ProductRef {
            code: &self.commodity_code,
            name: &self.commodity,
            local_name: None,
        }
    }

    fn location(&self) -> Option<LocationRef<'_>> {
        Some(LocationRef::Market {
            code: &self.market_code,
            name: &self.market,
            country: Some(CountryRef {
                code: &self.country_iso,
                name: &self.country_name,
            }),
        })
    }

    fn price_stage(&self) -> &str {
        &self.price_type
    }

    fn period_date(&self) -> Option<NaiveDate> {
        Some(self.date)
    }

    fn values(&self) -> (Option<f64>, f64, Option<f64>) {
        (None, self.price, None)
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    fn unit(&self) -> &str {
        &self.unit
    }
}

/// One record from any source, tagged by `"source"` in JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "UPPERCASE")]
pub enum SourceRecord {
    Az(AzRecord),
    Eu(EuRecord),
    Fao(FaoRecord),
    Fpma(FpmaRecord),
}

impl SourceRecord {
    pub fn as_observation(&self) -> &dyn ObservationSource {
        match self {
            SourceRecord::Az(record) => record,
            SourceRecord::Eu(record) => record,
            SourceRecord::Fao(record) => record,
            SourceRecord::Fpma(record) => record,
        }
    }
}
