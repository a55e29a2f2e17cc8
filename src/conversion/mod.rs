//! Currency and unit conversion through a common pivot.

mod converter;
mod rates;

pub use converter::{convert, convert_currency, convert_unit, Conversion, ConversionWarning};
pub use rates::{
    normalize_currency_code, normalize_unit_code, CurrencyRate, RateTable, RateTableExport,
    UnitRate,
};
pub(crate) use rates::validate_rate;
