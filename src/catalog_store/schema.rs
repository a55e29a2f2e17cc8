//! SQLite schema definitions for the price catalog database.
//!
//! Canonical tables hold the reference identity graph. `source_entities` holds
//! every per-feed product, market, country and price stage together with its
//! link pointer. Observations are immutable; aggregates are regenerated.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

// =============================================================================
// Canonical Tables
// =============================================================================

const COUNTRIES_TABLE: Table = Table {
    name: "canonical_countries",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("iso_code", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["iso_code"]],
};

const COUNTRY_FK: ForeignKey = ForeignKey {
    foreign_table: "canonical_countries",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Restrict,
};

/// Markets are owned by one country; names are unique within a country.
const MARKETS_TABLE: Table = Table {
    name: "canonical_markets",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "country_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&COUNTRY_FK)
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("market_type", &SqlType::Text),
    ],
    indices: &[("idx_markets_country", "country_id")],
    unique_constraints: &[&["country_id", "name"]],
};

const PRODUCTS_TABLE: Table = Table {
    name: "canonical_products",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("local_name", &SqlType::Text),
        sqlite_column!("category", &SqlType::Text),
        sqlite_column!("default_unit", &SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[&["name"]],
};

const PRODUCT_FK: ForeignKey = ForeignKey {
    foreign_table: "canonical_products",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Restrict,
};

const VARIETIES_TABLE: Table = Table {
    name: "canonical_varieties",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "product_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&PRODUCT_FK)
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_varieties_product", "product_id")],
    unique_constraints: &[&["product_id", "name"]],
};

const PRICE_STAGES_TABLE: Table = Table {
    name: "canonical_price_stages",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("code", &SqlType::Text, non_null = true), // PRODUCER, WHOLESALE, ...
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["code"]],
};

// =============================================================================
// Source Tables
// =============================================================================

/// One row per (kind, source, external_code). `canonical_id` points into the
/// canonical table matching `kind`; the variety columns only apply to products.
const SOURCE_ENTITIES_TABLE: Table = Table {
    name: "source_entities",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true), // 'product', 'market', 'country', 'price_stage'
        sqlite_column!("source", &SqlType::Text, non_null = true), // 'AZ', 'EU', 'FAO', 'FPMA'
        sqlite_column!("external_code", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("local_name", &SqlType::Text),
        sqlite_column!("parent_id", &SqlType::Integer),
        sqlite_column!("canonical_id", &SqlType::Integer),
        sqlite_column!("match_score", &SqlType::Real),
        sqlite_column!(
            "is_manual",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("variety_id", &SqlType::Integer),
        sqlite_column!("variety_score", &SqlType::Real),
        sqlite_column!(
            "variety_is_manual",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_source_entities_canonical", "canonical_id"),
        ("idx_source_entities_variety", "variety_id"),
        ("idx_source_entities_kind", "kind"),
    ],
    unique_constraints: &[&["kind", "source", "external_code"]],
};

const SOURCE_ENTITY_FK: ForeignKey = ForeignKey {
    foreign_table: "source_entities",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Restrict,
};

const RAW_OBSERVATIONS_TABLE: Table = Table {
    name: "raw_observations",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("source", &SqlType::Text, non_null = true),
        sqlite_column!(
            "source_product_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&SOURCE_ENTITY_FK)
        ),
        sqlite_column!("canonical_product_ref", &SqlType::Integer),
        sqlite_column!("market_ref", &SqlType::Integer),
        sqlite_column!("price_stage", &SqlType::Text, non_null = true),
        sqlite_column!("period_date", &SqlType::Text, non_null = true), // '2024-01-08'
        sqlite_column!("value_low", &SqlType::Real, non_null = true),
        sqlite_column!("value_avg", &SqlType::Real, non_null = true),
        sqlite_column!("value_high", &SqlType::Real, non_null = true),
        sqlite_column!("currency", &SqlType::Text, non_null = true),
        sqlite_column!("unit", &SqlType::Text, non_null = true),
        sqlite_column!(
            "ingested",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_observations_source_product", "source_product_id"),
        ("idx_observations_date", "period_date"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Derived and Reference Tables
// =============================================================================

/// `period` is 0 for annual records so that the uniqueness key holds in SQLite,
/// where NULLs never collide.
const AGGREGATE_RECORDS_TABLE: Table = Table {
    name: "aggregate_records",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("canonical_product_id", &SqlType::Integer, non_null = true),
        sqlite_column!("market_type_code", &SqlType::Text, non_null = true),
        sqlite_column!("period_type", &SqlType::Text, non_null = true), // 'WEEKLY', 'MONTHLY', 'ANNUAL'
        sqlite_column!("period", &SqlType::Integer, non_null = true),
        sqlite_column!("year", &SqlType::Integer, non_null = true),
        sqlite_column!("avg_price", &SqlType::Real, non_null = true),
        sqlite_column!("min_price", &SqlType::Real, non_null = true),
        sqlite_column!("max_price", &SqlType::Real, non_null = true),
        sqlite_column!("sample_count", &SqlType::Integer, non_null = true),
        sqlite_column!("start_date", &SqlType::Text, non_null = true),
        sqlite_column!("end_date", &SqlType::Text, non_null = true),
        sqlite_column!("currency", &SqlType::Text, non_null = true),
        sqlite_column!("unit", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_aggregates_product", "canonical_product_id")],
    unique_constraints: &[&[
        "canonical_product_id",
        "market_type_code",
        "period_type",
        "period",
        "year",
    ]],
};

const CURRENCY_RATES_TABLE: Table = Table {
    name: "currency_rates",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("code", &SqlType::Text, non_null = true),
        sqlite_column!("rate_to_base", &SqlType::Real, non_null = true),
        sqlite_column!(
            "updated",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[&["code"]],
};

const UNIT_RATES_TABLE: Table = Table {
    name: "unit_rates",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("code", &SqlType::Text, non_null = true),
        sqlite_column!("conversion_rate", &SqlType::Real, non_null = true),
        sqlite_column!("base_unit", &SqlType::Text, non_null = true),
        sqlite_column!(
            "updated",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[&["code"]],
};

// =============================================================================
// Versioned Schemas
// =============================================================================

pub const CATALOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        COUNTRIES_TABLE,
        MARKETS_TABLE,
        PRODUCTS_TABLE,
        VARIETIES_TABLE,
        PRICE_STAGES_TABLE,
        SOURCE_ENTITIES_TABLE,
        RAW_OBSERVATIONS_TABLE,
        AGGREGATE_RECORDS_TABLE,
        CURRENCY_RATES_TABLE,
        UNIT_RATES_TABLE,
    ],
    migration: None,
}];
