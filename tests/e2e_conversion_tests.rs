//! End-to-end tests for currency and unit conversion against stored rates

mod common;

use agri_price_engine::conversion::ConversionWarning;
use common::TestEngine;

#[test]
fn test_double_pivot_with_stored_rates() {
    let env = TestEngine::new();
    env.engine.upsert_currency_rate("C1", 0.55).unwrap();
    env.engine.upsert_currency_rate("C2", 1.70).unwrap();
    env.engine.upsert_unit_rate("kg", 1.0, "kg").unwrap();
    env.engine.upsert_unit_rate("100kg", 0.01, "kg").unwrap();

    let result = env.engine.convert(150.0, "C1", "C2", "100kg", "kg").unwrap();

    assert!(result.is_converted());
    assert!((result.value - 4.636).abs() < 1e-3);
    assert!((result.value - 150.0 / 0.55 * 1.70 * 0.01).abs() < 1e-9);
}

#[test]
fn test_codes_are_case_insensitive() {
    let env = TestEngine::new();
    env.seed_rates();

    let upper = env.engine.convert(10.0, "AZN", "USD", "KG", "T").unwrap();
    let lower = env.engine.convert(10.0, "azn", "usd", "kg", "t").unwrap();

    assert!(upper.is_converted());
    assert_eq!(upper, lower);
    assert!((upper.value - 10.0 / 1.7 * 1000.0).abs() < 1e-9);
}

#[test]
fn test_unknown_code_returns_original_value() {
    let env = TestEngine::new();
    env.seed_rates();

    let result = env.engine.convert(42.0, "XYZ", "USD", "kg", "kg").unwrap();

    assert_eq!(result.value, 42.0);
    assert_eq!(
        result.warning,
        Some(ConversionWarning::UnknownCurrencyOrUnit {
            code: "XYZ".to_string()
        })
    );
}

#[test]
fn test_mass_to_volume_is_refused() {
    let env = TestEngine::new();
    env.seed_rates();

    let result = env.engine.convert(3.0, "USD", "USD", "kg", "l").unwrap();

    assert_eq!(result.value, 3.0);
    assert!(matches!(
        result.warning,
        Some(ConversionWarning::IncompatibleDimension { .. })
    ));
    assert!(result.into_result().is_err());
}

#[test]
fn test_identical_codes_need_no_rates() {
    let env = TestEngine::new();
    let result = env.engine.convert(7.5, "ABC", "abc", "box", "box").unwrap();
    assert!(result.is_converted());
    assert_eq!(result.value, 7.5);
}

#[test]
fn test_rates_persist_and_export() {
    let env = TestEngine::new();
    env.seed_rates();
    env.engine.upsert_currency_rate("azn", 1.8).unwrap();

    let export = env.reopen().rate_table_export().unwrap();

    assert_eq!(export.currencies.len(), 3);
    assert_eq!(export.currencies["AZN"].rate_to_base, 1.8);
    assert_eq!(export.units["100kg"].base_unit, "kg");

    let json = serde_json::to_value(&export).unwrap();
    assert_eq!(json["currencies"]["AZN"]["rateToBase"], 1.8);
    assert_eq!(json["units"]["t"]["conversionRate"], 0.001);
}

#[test]
fn test_non_positive_rates_are_rejected() {
    let env = TestEngine::new();
    assert!(env.engine.upsert_currency_rate("USD", 0.0).is_err());
    assert!(env.engine.upsert_unit_rate("kg", -1.0, "kg").is_err());
    assert!(env.engine.rate_table().unwrap().is_empty());
}
