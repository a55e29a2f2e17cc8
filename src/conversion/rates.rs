//! Currency and unit rate tables.
//!
//! A currency rate reads "1 unit of the base currency = `rate_to_base` of this
//! currency". A unit rate reads "1 base unit = `conversion_rate` of this unit",
//! so the "100kg" unit has a rate of 0.01 against the "kg" base.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyRate {
    pub rate_to_base: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRate {
    pub conversion_rate: f64,
    pub base_unit: String,
}

pub fn normalize_currency_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn normalize_unit_code(code: &str) -> String {
    code.trim().to_lowercase()
}

pub(crate) fn validate_rate(code: &str, rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        bail!("Rate for '{}' must be a positive number, got {}", code, rate);
    }
    Ok(())
}

/// In-memory snapshot of both rate tables. Cheap to clone and safe to share
/// across readers; conversion never mutates it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateTable {
    currencies: BTreeMap<String, CurrencyRate>,
    units: BTreeMap<String, UnitRate>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_currency(mut self, code: &str, rate_to_base: f64) -> Result<Self> {
        self.set_currency(code, rate_to_base)?;
        Ok(self)
    }

    pub fn with_unit(mut self, code: &str, conversion_rate: f64, base_unit: &str) -> Result<Self> {
        self.set_unit(code, conversion_rate, base_unit)?;
        Ok(self)
    }

    pub fn set_currency(&mut self, code: &str, rate_to_base: f64) -> Result<()> {
        validate_rate(code, rate_to_base)?;
        self.currencies
            .insert(normalize_currency_code(code), CurrencyRate { rate_to_base });
        Ok(())
    }

    pub fn set_unit(&mut self, code: &str, conversion_rate: f64, base_unit: &str) -> Result<()> {
        validate_rate(code, conversion_rate)?;
        self.units.insert(
            normalize_unit_code(code),
            UnitRate {
                conversion_rate,
                base_unit: normalize_unit_code(base_unit),
            },
        );
        Ok(())
    }

    pub fn currency(&self, code: &str) -> Option<&CurrencyRate> {
        self.currencies.get(&normalize_currency_code(code))
    }

    pub fn unit(&self, code: &str) -> Option<&UnitRate> {
        self.units.get(&normalize_unit_code(code))
    }

    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty() && self.units.is_empty()
    }

    /// Read-only view for clients that convert on their side.
    pub fn export(&self) -> RateTableExport {
        RateTableExport {
            currencies: self.currencies.clone(),
            units: self.units.clone(),
        }
    }
}

/// Serialized as
/// `{ "currencies": { code: { "rateToBase" } }, "units": { code: { "conversionRate", "baseUnit" } } }`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateTableExport {
    pub currencies: BTreeMap<String, CurrencyRate>,
    pub units: BTreeMap<String, UnitRate>,
}
