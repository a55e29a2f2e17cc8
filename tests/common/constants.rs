//! Shared test data

#![allow(dead_code)]

pub const POTATO: &str = "Potato";
pub const ONION: &str = "Onion";
pub const WHEAT: &str = "Wheat";

pub const AZ_POTATO_CODE: &str = "0701";
pub const AZ_POTATO_NAME: &str = "POTATO";
pub const AZ_POTATO_LOCAL: &str = "Kartof";

pub const FPMA_ONION_CODE: &str = "ONI";
pub const FPMA_ONION_NAME: &str = "Onions (red)";

/// Base currency is USD; units pivot through kg.
pub const CURRENCY_RATES: &[(&str, f64)] = &[("USD", 1.0), ("AZN", 1.7), ("EUR", 0.92)];
pub const UNIT_RATES: &[(&str, f64, &str)] = &[
    ("kg", 1.0, "kg"),
    ("100kg", 0.01, "kg"),
    ("t", 0.001, "kg"),
    ("l", 1.0, "l"),
];

/// Floating point tolerance for aggregate comparisons.
pub const EPSILON: f64 = 1e-9;
