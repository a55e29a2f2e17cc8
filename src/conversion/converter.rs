use super::rates::RateTable;
use crate::error::EngineError;
use crate::metrics;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Why a conversion fell back to the original value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversionWarning {
    UnknownCurrencyOrUnit { code: String },
    IncompatibleDimension { from: String, to: String },
}

impl ConversionWarning {
    fn metric_reason(&self) -> &'static str {
        match self {
            ConversionWarning::UnknownCurrencyOrUnit { .. } => "unknown_code",
            ConversionWarning::IncompatibleDimension { .. } => "incompatible_dimension",
        }
    }
}

impl std::fmt::Display for ConversionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionWarning::UnknownCurrencyOrUnit { code } => {
                write!(f, "unknown currency or unit code '{}'", code)
            }
            ConversionWarning::IncompatibleDimension { from, to } => {
                write!(f, "units '{}' and '{}' measure different dimensions", from, to)
            }
        }
    }
}

impl From<ConversionWarning> for EngineError {
    fn from(warning: ConversionWarning) -> Self {
        match warning {
            ConversionWarning::UnknownCurrencyOrUnit { code } => {
                EngineError::UnknownCurrencyOrUnit(code)
            }
            ConversionWarning::IncompatibleDimension { from, to } => {
                EngineError::IncompatibleDimension { from, to }
            }
        }
    }
}

/// Result of a conversion. When `warning` is set, `value` is the input value,
/// unconverted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<ConversionWarning>,
}

impl Conversion {
    fn converted(value: f64) -> Self {
        Conversion {
            value,
            warning: None,
        }
    }

    fn refused(original: f64, warning: ConversionWarning) -> Self {
        metrics::record_conversion_warning(warning.metric_reason());
        debug!("Conversion refused: {}", warning);
        Conversion {
            value: original,
            warning: Some(warning),
        }
    }

    pub fn is_converted(&self) -> bool {
        self.warning.is_none()
    }

    /// For callers that treat a refused conversion as an error.
    pub fn into_result(self) -> Result<f64, EngineError> {
        match self.warning {
            None => Ok(self.value),
            Some(warning) => Err(warning.into()),
        }
    }
}

/// Convert a price from `(from_currency, from_unit)` into `(to_currency, to_unit)`.
///
/// Currency pivots through the base currency, unit pivots through the base
/// unit. Never fails: a missing code or a cross-dimension unit pair returns
/// the original value with a warning. Identical codes skip the lookup.
pub fn convert(
    value: f64,
    from_currency: &str,
    to_currency: &str,
    from_unit: &str,
    to_unit: &str,
    rates: &RateTable,
) -> Conversion {
    let currency_factor = match currency_factor(from_currency, to_currency, rates) {
        Ok(factor) => factor,
        Err(warning) => return Conversion::refused(value, warning),
    };
    let unit_factor = match unit_factor(from_unit, to_unit, rates) {
        Ok(factor) => factor,
        Err(warning) => return Conversion::refused(value, warning),
    };
    Conversion::converted(value * currency_factor * unit_factor)
}

/// Currency-only conversion.
pub fn convert_currency(value: f64, from: &str, to: &str, rates: &RateTable) -> Conversion {
    match currency_factor(from, to, rates) {
        Ok(factor) => Conversion::converted(value * factor),
        Err(warning) => Conversion::refused(value, warning),
    }
}

/// Unit-only conversion of a price per `from` into a price per `to`.
pub fn convert_unit(value: f64, from: &str, to: &str, rates: &RateTable) -> Conversion {
    match unit_factor(from, to, rates) {
        Ok(factor) => Conversion::converted(value * factor),
        Err(warning) => Conversion::refused(value, warning),
    }
}

fn currency_factor(from: &str, to: &str, rates: &RateTable) -> Result<f64, ConversionWarning> {
    if from.trim().eq_ignore_ascii_case(to.trim()) {
        return Ok(1.0);
    }
    let from_rate = rates
        .currency(from)
        .ok_or_else(|| unknown(from))?
        .rate_to_base;
    let to_rate = rates.currency(to).ok_or_else(|| unknown(to))?.rate_to_base;
    // value / from.rate_to_base gives the base amount, times to.rate_to_base the target
    Ok(to_rate / from_rate)
}

fn unit_factor(from: &str, to: &str, rates: &RateTable) -> Result<f64, ConversionWarning> {
    if from.trim().eq_ignore_ascii_case(to.trim()) {
        return Ok(1.0);
    }
    let from_rate = rates.unit(from).ok_or_else(|| unknown(from))?;
    let to_rate = rates.unit(to).ok_or_else(|| unknown(to))?;
    if from_rate.base_unit != to_rate.base_unit {
        return Err(ConversionWarning::IncompatibleDimension {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    // price per base = value * from.conversion_rate, price per target = that / to.conversion_rate
    Ok(from_rate.conversion_rate / to_rate.conversion_rate)
}

fn unknown(code: &str) -> ConversionWarning {
    ConversionWarning::UnknownCurrencyOrUnit {
        code: code.to_string(),
    }
}
