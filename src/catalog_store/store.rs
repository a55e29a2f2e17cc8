//! SQLite-backed catalog store implementation.
//!
//! One write connection guarded by a mutex. Multi-statement operations run in
//! a rusqlite transaction so a failure leaves the previous state intact.

use super::models::*;
use super::schema::CATALOG_VERSIONED_SCHEMAS;
use super::trait_def::{CatalogStore, StageLink};
use crate::conversion::{normalize_currency_code, normalize_unit_code, validate_rate, RateTable};
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Upper bound on ids bound into a single `IN (...)` clause.
const MAX_IN_PARAMS: usize = 500;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SOURCE_ENTITY_COLUMNS: &str = "id, kind, source, external_code, name, local_name, \
     parent_id, canonical_id, match_score, is_manual, variety_id, variety_score, variety_is_manual";

const OBSERVATION_COLUMNS: &str = "id, source, source_product_id, canonical_product_ref, \
     market_ref, price_stage, period_date, value_low, value_avg, value_high, currency, unit";

const AGGREGATE_COLUMNS: &str = "canonical_product_id, market_type_code, period_type, period, \
     year, avg_price, min_price, max_price, sample_count, start_date, end_date, currency, unit";

/// SQLite-backed catalog store.
#[derive(Clone)]
pub struct SqliteCatalogStore {
    conn: Arc<Mutex<Connection>>,
}

fn migrate_if_needed(conn: &mut Connection) -> Result<()> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    let latest_version = CATALOG_VERSIONED_SCHEMAS.len() - 1;
    let latest_schema = &CATALOG_VERSIONED_SCHEMAS[latest_version];

    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |r| r.get(0),
    )?;

    if table_count == 0 {
        info!("Creating catalog db schema at version {}", latest_version);
        latest_schema.create(conn)?;
        return Ok(());
    }

    if db_version < BASE_DB_VERSION as i64 {
        bail!(
            "Catalog database version {} does not contain base db version {}, refusing to open",
            db_version,
            BASE_DB_VERSION
        );
    }
    let mut current_version = (db_version - BASE_DB_VERSION as i64) as usize;

    if current_version > latest_version {
        bail!(
            "Catalog database version {} is too new (max supported: {})",
            current_version,
            latest_version
        );
    }

    #[cfg(not(feature = "no_checks"))]
    CATALOG_VERSIONED_SCHEMAS[current_version]
        .validate(conn)
        .context("Catalog database schema does not match its declared version")?;

    if current_version == latest_version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in CATALOG_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!(
                "Migrating catalog db from version {} to {}",
                current_version, schema.version
            );
            migration_fn(&tx)?;
        }
        current_version = schema.version;
    }
    tx.pragma_update(None, "user_version", BASE_DB_VERSION + current_version)?;
    tx.commit()?;
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_date(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, DATE_FORMAT)
        .map_err(|e| conversion_error(idx, format!("invalid date '{}': {}", text, e)))
}

fn get_kind(row: &Row, idx: usize) -> rusqlite::Result<EntityKind> {
    let text: String = row.get(idx)?;
    EntityKind::from_db_str(&text)
        .ok_or_else(|| conversion_error(idx, format!("unknown entity kind '{}'", text)))
}

fn get_source(row: &Row, idx: usize) -> rusqlite::Result<SourceKind> {
    let text: String = row.get(idx)?;
    SourceKind::from_db_str(&text)
        .ok_or_else(|| conversion_error(idx, format!("unknown source '{}'", text)))
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn canonical_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Product => "canonical_products",
        EntityKind::Variety => "canonical_varieties",
        EntityKind::Market => "canonical_markets",
        EntityKind::Country => "canonical_countries",
        EntityKind::PriceStage => "canonical_price_stages",
    }
}

impl SqliteCatalogStore {
    /// Open (or create) the catalog database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open catalog database {:?}", db_path_ref))?;

        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        migrate_if_needed(&mut conn)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let product_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM canonical_products", [], |r| r.get(0))?;
        let observation_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM raw_observations", [], |r| r.get(0))?;
        info!(
            "Opened price catalog {:?}: {} canonical products, {} raw observations",
            db_path_ref, product_count, observation_count
        );

        Ok(SqliteCatalogStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an empty in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        CATALOG_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteCatalogStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_source_entity(row: &Row) -> rusqlite::Result<SourceEntity> {
        Ok(SourceEntity {
            id: row.get(0)?,
            kind: get_kind(row, 1)?,
            source: get_source(row, 2)?,
            external_code: row.get(3)?,
            name: row.get(4)?,
            local_name: row.get(5)?,
            parent_id: row.get(6)?,
            canonical_id: row.get(7)?,
            match_score: row.get(8)?,
            is_manual: row.get(9)?,
            variety_id: row.get(10)?,
            variety_score: row.get(11)?,
            variety_is_manual: row.get(12)?,
        })
    }

    fn row_to_observation(row: &Row) -> rusqlite::Result<RawObservation> {
        Ok(RawObservation {
            id: row.get(0)?,
            source: get_source(row, 1)?,
            source_product_id: row.get(2)?,
            canonical_product_ref: row.get(3)?,
            market_ref: row.get(4)?,
            price_stage: row.get(5)?,
            period_date: get_date(row, 6)?,
            value_low: row.get(7)?,
            value_avg: row.get(8)?,
            value_high: row.get(9)?,
            currency: row.get(10)?,
            unit: row.get(11)?,
        })
    }

    fn row_to_aggregate(row: &Row) -> rusqlite::Result<AggregateRecord> {
        let period_type_text: String = row.get(2)?;
        let period_type = PeriodType::from_db_str(&period_type_text).ok_or_else(|| {
            conversion_error(2, format!("unknown period type '{}'", period_type_text))
        })?;
        let period: u32 = row.get(3)?;
        Ok(AggregateRecord {
            canonical_product_id: row.get(0)?,
            market_type_code: row.get(1)?,
            period_type,
            period: if period_type == PeriodType::Annual {
                None
            } else {
                Some(period)
            },
            year: row.get(4)?,
            avg_price: row.get(5)?,
            min_price: row.get(6)?,
            max_price: row.get(7)?,
            sample_count: row.get(8)?,
            start_date: get_date(row, 9)?,
            end_date: get_date(row, 10)?,
            currency: row.get(11)?,
            unit: row.get(12)?,
        })
    }

    fn count(conn: &Connection, sql: &str, id: i64) -> Result<usize> {
        let count: i64 = conn.query_row(sql, params![id], |r| r.get(0))?;
        Ok(count as usize)
    }

    fn count_dependents_on(conn: &Connection, kind: EntityKind, id: i64) -> Result<usize> {
        let linked = Self::count(
            conn,
            match kind {
                EntityKind::Variety => {
                    "SELECT COUNT(*) FROM source_entities WHERE kind = 'product' AND variety_id = ?1"
                }
                EntityKind::Product => {
                    "SELECT COUNT(*) FROM source_entities WHERE kind = 'product' AND canonical_id = ?1"
                }
                EntityKind::Market => {
                    "SELECT COUNT(*) FROM source_entities WHERE kind = 'market' AND canonical_id = ?1"
                }
                EntityKind::Country => {
                    "SELECT COUNT(*) FROM source_entities WHERE kind = 'country' AND canonical_id = ?1"
                }
                EntityKind::PriceStage => {
                    "SELECT COUNT(*) FROM source_entities WHERE kind = 'price_stage' AND canonical_id = ?1"
                }
            },
            id,
        )?;
        let owned = match kind {
            EntityKind::Product => {
                Self::count(
                    conn,
                    "SELECT COUNT(*) FROM canonical_varieties WHERE product_id = ?1",
                    id,
                )? + Self::count(
                    conn,
                    "SELECT COUNT(*) FROM aggregate_records WHERE canonical_product_id = ?1",
                    id,
                )?
            }
            EntityKind::Country => Self::count(
                conn,
                "SELECT COUNT(*) FROM canonical_markets WHERE country_id = ?1",
                id,
            )?,
            _ => 0,
        };
        Ok(linked + owned)
    }

    fn exists_on(conn: &Connection, kind: EntityKind, id: i64) -> Result<bool> {
        let found = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", canonical_table(kind)),
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl CatalogStore for SqliteCatalogStore {
    // =========================================================================
    // Canonical Records
    // =========================================================================

    fn create_country(&self, iso_code: &str, name: &str) -> Result<CanonicalCountry> {
        let conn = self.conn.lock().unwrap();
        let iso_code = iso_code.trim().to_uppercase();
        conn.execute(
            "INSERT INTO canonical_countries (iso_code, name) VALUES (?1, ?2)",
            params![iso_code, name],
        )
        .with_context(|| format!("Failed to create country {}", iso_code))?;
        Ok(CanonicalCountry {
            id: conn.last_insert_rowid(),
            iso_code,
            name: name.to_string(),
        })
    }

    fn create_market(
        &self,
        country_id: i64,
        name: &str,
        market_type: Option<&str>,
    ) -> Result<CanonicalMarket> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO canonical_markets (country_id, name, market_type) VALUES (?1, ?2, ?3)",
            params![country_id, name, market_type],
        )
        .with_context(|| format!("Failed to create market '{}' in country {}", name, country_id))?;
        Ok(CanonicalMarket {
            id: conn.last_insert_rowid(),
            country_id,
            name: name.to_string(),
            market_type: market_type.map(str::to_string),
        })
    }

    fn create_product(&self, product: &NewCanonicalProduct) -> Result<CanonicalProduct> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO canonical_products (name, local_name, category, default_unit)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                product.name,
                product.local_name,
                product.category,
                product.default_unit
            ],
        )
        .with_context(|| format!("Failed to create product '{}'", product.name))?;
        Ok(CanonicalProduct {
            id: conn.last_insert_rowid(),
            name: product.name.clone(),
            local_name: product.local_name.clone(),
            category: product.category.clone(),
            default_unit: product.default_unit.clone(),
        })
    }

    fn create_variety(&self, product_id: i64, name: &str) -> Result<CanonicalVariety> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO canonical_varieties (product_id, name) VALUES (?1, ?2)",
            params![product_id, name],
        )
        .with_context(|| format!("Failed to create variety '{}' of product {}", name, product_id))?;
        Ok(CanonicalVariety {
            id: conn.last_insert_rowid(),
            product_id,
            name: name.to_string(),
        })
    }

    fn create_price_stage(&self, code: &str, name: &str) -> Result<CanonicalPriceStage> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO canonical_price_stages (code, name) VALUES (?1, ?2)",
            params![code, name],
        )
        .with_context(|| format!("Failed to create price stage {}", code))?;
        Ok(CanonicalPriceStage {
            id: conn.last_insert_rowid(),
            code: code.to_string(),
            name: name.to_string(),
        })
    }

    fn get_product(&self, id: i64) -> Result<Option<CanonicalProduct>> {
        let conn = self.conn.lock().unwrap();
        let product = conn
            .query_row(
                "SELECT id, name, local_name, category, default_unit
                 FROM canonical_products WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CanonicalProduct {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        local_name: row.get(2)?,
                        category: row.get(3)?,
                        default_unit: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(product)
    }

    fn list_products(&self) -> Result<Vec<CanonicalProduct>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, local_name, category, default_unit
             FROM canonical_products ORDER BY id",
        )?;
        let products = stmt
            .query_map([], |row| {
                Ok(CanonicalProduct {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    local_name: row.get(2)?,
                    category: row.get(3)?,
                    default_unit: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    fn canonical_exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::exists_on(&conn, kind, id)
    }

    fn canonical_parent(&self, kind: EntityKind, id: i64) -> Result<Option<i64>> {
        let sql = match kind {
            EntityKind::Variety => "SELECT product_id FROM canonical_varieties WHERE id = ?1",
            EntityKind::Market => "SELECT country_id FROM canonical_markets WHERE id = ?1",
            _ => return Ok(None),
        };
        let conn = self.conn.lock().unwrap();
        let parent = conn
            .query_row(sql, params![id], |r| r.get(0))
            .optional()?;
        Ok(parent)
    }

    fn list_canonical(&self, kind: EntityKind) -> Result<Vec<CanonicalEntity>> {
        let sql = match kind {
            EntityKind::Product => {
                "SELECT id, name, local_name, NULL FROM canonical_products ORDER BY id"
            }
            EntityKind::Variety => {
                "SELECT id, name, NULL, product_id FROM canonical_varieties ORDER BY id"
            }
            EntityKind::Market => {
                "SELECT id, name, NULL, country_id FROM canonical_markets ORDER BY id"
            }
            EntityKind::Country => {
                "SELECT id, name, iso_code, NULL FROM canonical_countries ORDER BY id"
            }
            EntityKind::PriceStage => {
                "SELECT id, name, code, NULL FROM canonical_price_stages ORDER BY id"
            }
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let entities = stmt
            .query_map([], |row| {
                let mut names = vec![row.get::<_, String>(1)?];
                if let Some(alt) = row.get::<_, Option<String>>(2)? {
                    names.push(alt);
                }
                Ok(CanonicalEntity {
                    id: row.get(0)?,
                    kind,
                    names,
                    parent_id: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    fn count_dependents(&self, kind: EntityKind, id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Self::count_dependents_on(&conn, kind, id)
    }

    fn delete_canonical(&self, kind: EntityKind, id: i64) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if !Self::exists_on(&tx, kind, id)? {
            return Ok(DeleteOutcome::NotFound);
        }
        let dependents = Self::count_dependents_on(&tx, kind, id)?;
        if dependents > 0 {
            return Ok(DeleteOutcome::HasDependents(dependents));
        }
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", canonical_table(kind)),
            params![id],
        )?;
        tx.commit()?;
        debug!("Deleted canonical {} {}", kind, id);
        Ok(DeleteOutcome::Deleted)
    }

    // =========================================================================
    // Source Entities and Links
    // =========================================================================

    fn register_source_entity(&self, entity: &NewSourceEntity) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO source_entities (kind, source, external_code, name, local_name, parent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, source, external_code) DO UPDATE SET
                name = excluded.name,
                local_name = coalesce(excluded.local_name, local_name),
                parent_id = coalesce(excluded.parent_id, parent_id)",
            params![
                entity.kind.to_db_str(),
                entity.source.to_db_str(),
                entity.external_code,
                entity.name,
                entity.local_name,
                entity.parent_id
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM source_entities WHERE kind = ?1 AND source = ?2 AND external_code = ?3",
            params![
                entity.kind.to_db_str(),
                entity.source.to_db_str(),
                entity.external_code
            ],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    fn get_source_entity(&self, id: i64) -> Result<Option<SourceEntity>> {
        let conn = self.conn.lock().unwrap();
        let entity = conn
            .query_row(
                &format!(
                    "SELECT {} FROM source_entities WHERE id = ?1",
                    SOURCE_ENTITY_COLUMNS
                ),
                params![id],
                Self::row_to_source_entity,
            )
            .optional()?;
        Ok(entity)
    }

    fn find_unlinked(
        &self,
        kind: EntityKind,
        filter: &UnlinkedFilter,
    ) -> Result<Vec<SourceEntity>> {
        let condition = match kind {
            EntityKind::Variety => {
                "kind = 'product' AND canonical_id IS NOT NULL AND variety_id IS NULL
                 AND (?2 OR variety_is_manual = 0)"
            }
            _ => "kind = ?1 AND canonical_id IS NULL AND (?2 OR is_manual = 0)",
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM source_entities WHERE {} AND (?3 IS NULL OR source = ?3) ORDER BY id",
            SOURCE_ENTITY_COLUMNS, condition
        ))?;
        let candidates = stmt
            .query_map(
                params![
                    kind.source_entity_kind().to_db_str(),
                    filter.include_manual,
                    filter.source.map(|s| s.to_db_str())
                ],
                Self::row_to_source_entity,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        // Name filtering is done here rather than in SQL, whose lower() only
        // folds ASCII.
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(candidates
            .into_iter()
            .filter(|e| filter.matches(e))
            .take(limit)
            .collect())
    }

    fn set_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: Option<f64>,
        is_manual: bool,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = match kind {
            EntityKind::Variety => tx.execute(
                "UPDATE source_entities
                 SET variety_id = ?2, variety_score = ?3, variety_is_manual = ?4
                 WHERE id = ?1 AND kind = 'product'
                   AND (?2 IS NULL OR canonical_id =
                        (SELECT product_id FROM canonical_varieties WHERE id = ?2))",
                params![source_id, canonical_id, score, is_manual],
            )?,
            _ => {
                if kind == EntityKind::Product {
                    // A variety only makes sense under the product it was linked with
                    tx.execute(
                        "UPDATE source_entities
                         SET variety_id = NULL, variety_score = NULL, variety_is_manual = 0
                         WHERE id = ?1 AND canonical_id IS NOT ?2",
                        params![source_id, canonical_id],
                    )?;
                }
                tx.execute(
                    "UPDATE source_entities SET canonical_id = ?2, match_score = ?3, is_manual = ?4
                     WHERE id = ?1 AND kind = ?5",
                    params![
                        source_id,
                        canonical_id,
                        score,
                        is_manual,
                        kind.to_db_str()
                    ],
                )?
            }
        };
        tx.commit()?;
        Ok(changed > 0)
    }

    fn try_auto_link(
        &self,
        kind: EntityKind,
        source_id: i64,
        canonical_id: Option<i64>,
        score: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = match kind {
            EntityKind::Variety => conn.execute(
                "UPDATE source_entities SET variety_id = ?2, variety_score = ?3
                 WHERE id = ?1 AND kind = 'product'
                   AND variety_is_manual = 0 AND variety_id IS NULL
                   AND (?2 IS NULL OR canonical_id =
                        (SELECT product_id FROM canonical_varieties WHERE id = ?2))
                   AND (?2 IS NOT NULL OR variety_score IS NOT ?3)",
                params![source_id, canonical_id, score],
            )?,
            _ => conn.execute(
                "UPDATE source_entities SET canonical_id = ?2, match_score = ?3
                 WHERE id = ?1 AND kind = ?4
                   AND is_manual = 0 AND canonical_id IS NULL
                   AND (?2 IS NOT NULL OR match_score IS NOT ?3)",
                params![source_id, canonical_id, score, kind.to_db_str()],
            )?,
        };
        Ok(changed > 0)
    }

    fn source_products_for_canonical(&self, product_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM source_entities
             WHERE kind = 'product'
               AND (canonical_id = ?1
                    OR variety_id IN (SELECT id FROM canonical_varieties WHERE product_id = ?1))
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![product_id], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn canonical_products_for_sources(&self, source_ids: &[i64]) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut products = Vec::new();
        for chunk in source_ids.chunks(MAX_IN_PARAMS) {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT canonical_id FROM source_entities
                 WHERE kind = 'product' AND canonical_id IS NOT NULL AND id IN ({})",
                placeholders(chunk.len())
            ))?;
            let ids = stmt
                .query_map(params_from_iter(chunk.iter()), |r| r.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            products.extend(ids);
        }
        products.sort_unstable();
        products.dedup();
        Ok(products)
    }

    fn aggregation_candidate_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT canonical_id FROM source_entities
             WHERE kind = 'product' AND canonical_id IS NOT NULL
             UNION
             SELECT canonical_product_id FROM aggregate_records
             ORDER BY 1",
        )?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn price_stage_links(&self) -> Result<Vec<StageLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT se.source, se.external_code, cs.code
             FROM source_entities se
             JOIN canonical_price_stages cs ON cs.id = se.canonical_id
             WHERE se.kind = 'price_stage'
             ORDER BY se.id",
        )?;
        let links = stmt
            .query_map([], |row| {
                Ok((get_source(row, 0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    fn market_type_hints(&self, market_refs: &[i64]) -> Result<HashMap<i64, String>> {
        let conn = self.conn.lock().unwrap();
        let mut hints = HashMap::new();
        for chunk in market_refs.chunks(MAX_IN_PARAMS) {
            let mut stmt = conn.prepare(&format!(
                "SELECT se.id, cm.market_type
                 FROM source_entities se
                 JOIN canonical_markets cm ON cm.id = se.canonical_id
                 WHERE se.kind = 'market' AND cm.market_type IS NOT NULL AND se.id IN ({})",
                placeholders(chunk.len())
            ))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            hints.extend(rows);
        }
        Ok(hints)
    }

    // =========================================================================
    // Observations
    // =========================================================================

    fn insert_observations(&self, observations: &[NewRawObservation]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO raw_observations
                    (source, source_product_id, canonical_product_ref, market_ref, price_stage,
                     period_date, value_low, value_avg, value_high, currency, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for obs in observations {
                stmt.execute(params![
                    obs.source.to_db_str(),
                    obs.source_product_id,
                    obs.canonical_product_ref,
                    obs.market_ref,
                    obs.price_stage,
                    format_date(obs.period_date),
                    obs.value_low,
                    obs.value_avg,
                    obs.value_high,
                    obs.currency,
                    obs.unit
                ])
                .with_context(|| {
                    format!(
                        "Failed to store observation of source product {}",
                        obs.source_product_id
                    )
                })?;
            }
        }
        tx.commit()?;
        Ok(observations.len())
    }

    fn observations_for_source_products(
        &self,
        source_ids: &[i64],
    ) -> Result<Vec<RawObservation>> {
        let conn = self.conn.lock().unwrap();
        let mut observations = Vec::new();
        for chunk in source_ids.chunks(MAX_IN_PARAMS) {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM raw_observations WHERE source_product_id IN ({})
                 ORDER BY period_date, id",
                OBSERVATION_COLUMNS,
                placeholders(chunk.len())
            ))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), Self::row_to_observation)?
                .collect::<Result<Vec<_>, _>>()?;
            observations.extend(rows);
        }
        if source_ids.len() > MAX_IN_PARAMS {
            observations.sort_by(|a, b| (a.period_date, a.id).cmp(&(b.period_date, b.id)));
        }
        Ok(observations)
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    fn replace_aggregates(&self, product_id: i64, records: &[AggregateRecord]) -> Result<()> {
        if let Some(stray) = records
            .iter()
            .find(|r| r.canonical_product_id != product_id)
        {
            bail!(
                "Aggregate for product {} passed to the replacement of product {}",
                stray.canonical_product_id,
                product_id
            );
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM aggregate_records WHERE canonical_product_id = ?1",
            params![product_id],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO aggregate_records ({}) VALUES
                    (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                AGGREGATE_COLUMNS
            ))?;
            for record in records {
                stmt.execute(params![
                    record.canonical_product_id,
                    record.market_type_code,
                    record.period_type.to_db_str(),
                    record.period.unwrap_or(0),
                    record.year,
                    record.avg_price,
                    record.min_price,
                    record.max_price,
                    record.sample_count,
                    format_date(record.start_date),
                    format_date(record.end_date),
                    record.currency,
                    record.unit
                ])?;
            }
        }
        // Dropping `tx` without commit rolls back, keeping the previous set
        tx.commit()
            .with_context(|| format!("Failed to commit aggregates of product {}", product_id))?;
        Ok(())
    }

    fn aggregates_for_product(&self, product_id: i64) -> Result<Vec<AggregateRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM aggregate_records WHERE canonical_product_id = ?1",
            AGGREGATE_COLUMNS
        ))?;
        let mut records = stmt
            .query_map(params![product_id], Self::row_to_aggregate)?
            .collect::<Result<Vec<_>, _>>()?;
        AggregateRecord::sort(&mut records);
        Ok(records)
    }

    // =========================================================================
    // Rate Tables
    // =========================================================================

    fn upsert_currency_rate(&self, code: &str, rate_to_base: f64) -> Result<()> {
        validate_rate(code, rate_to_base)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO currency_rates (code, rate_to_base) VALUES (?1, ?2)
             ON CONFLICT(code) DO UPDATE SET
                rate_to_base = excluded.rate_to_base,
                updated = cast(strftime('%s','now') as int)",
            params![normalize_currency_code(code), rate_to_base],
        )?;
        Ok(())
    }

    fn upsert_unit_rate(&self, code: &str, conversion_rate: f64, base_unit: &str) -> Result<()> {
        validate_rate(code, conversion_rate)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO unit_rates (code, conversion_rate, base_unit) VALUES (?1, ?2, ?3)
             ON CONFLICT(code) DO UPDATE SET
                conversion_rate = excluded.conversion_rate,
                base_unit = excluded.base_unit,
                updated = cast(strftime('%s','now') as int)",
            params![
                normalize_unit_code(code),
                conversion_rate,
                normalize_unit_code(base_unit)
            ],
        )?;
        Ok(())
    }

    fn load_rate_table(&self) -> Result<RateTable> {
        let conn = self.conn.lock().unwrap();
        let mut table = RateTable::new();

        let mut stmt = conn.prepare("SELECT code, rate_to_base FROM currency_rates")?;
        let currencies = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (code, rate) in currencies {
            if let Err(e) = table.set_currency(&code, rate) {
                warn!("Skipping currency rate {}: {}", code, e);
            }
        }

        let mut stmt = conn.prepare("SELECT code, conversion_rate, base_unit FROM unit_rates")?;
        let units = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (code, rate, base_unit) in units {
            if let Err(e) = table.set_unit(&code, rate, &base_unit) {
                warn!("Skipping unit rate {}: {}", code, e);
            }
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteCatalogStore {
        SqliteCatalogStore::in_memory().unwrap()
    }

    fn source_product(store: &SqliteCatalogStore, code: &str, name: &str) -> i64 {
        store
            .register_source_entity(&NewSourceEntity {
                kind: EntityKind::Product,
                source: SourceKind::Az,
                external_code: code.to_string(),
                name: name.to_string(),
                local_name: None,
                parent_id: None,
            })
            .unwrap()
    }

    fn aggregate(product_id: i64, period: Option<u32>, avg: f64) -> AggregateRecord {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        AggregateRecord {
            canonical_product_id: product_id,
            market_type_code: "RETAIL".to_string(),
            period_type: if period.is_some() {
                PeriodType::Weekly
            } else {
                PeriodType::Annual
            },
            period,
            year: 2024,
            avg_price: avg,
            min_price: avg,
            max_price: avg,
            sample_count: 1,
            start_date: date,
            end_date: date,
            currency: "AZN".to_string(),
            unit: "kg".to_string(),
        }
    }

    #[test]
    fn test_register_source_entity_is_idempotent() {
        let store = store();
        let first = source_product(&store, "P-1", "Potato");
        let second = source_product(&store, "P-1", "Potatoes");
        assert_eq!(first, second);
        assert_eq!(store.get_source_entity(first).unwrap().unwrap().name, "Potatoes");
    }

    #[test]
    fn test_auto_link_never_overwrites_manual_link() {
        let store = store();
        let a = store.create_product(&NewCanonicalProduct { name: "Potato".into(), ..Default::default() }).unwrap();
        let b = store.create_product(&NewCanonicalProduct { name: "Tomato".into(), ..Default::default() }).unwrap();
        let sp = source_product(&store, "P-1", "Potato");

        assert!(store.set_link(EntityKind::Product, sp, Some(a.id), Some(1.0), true).unwrap());
        assert!(!store.try_auto_link(EntityKind::Product, sp, Some(b.id), 0.99).unwrap());

        let entity = store.get_source_entity(sp).unwrap().unwrap();
        assert_eq!(entity.canonical_id, Some(a.id));
        assert!(entity.is_manual);
    }

    #[test]
    fn test_variety_link_requires_matching_parent() {
        let store = store();
        let potato = store.create_product(&NewCanonicalProduct { name: "Potato".into(), ..Default::default() }).unwrap();
        let tomato = store.create_product(&NewCanonicalProduct { name: "Tomato".into(), ..Default::default() }).unwrap();
        let cherry = store.create_variety(tomato.id, "Cherry").unwrap();
        let sp = source_product(&store, "P-1", "Potato");
        store.set_link(EntityKind::Product, sp, Some(potato.id), Some(1.0), true).unwrap();

        assert!(!store.set_link(EntityKind::Variety, sp, Some(cherry.id), Some(1.0), true).unwrap());

        store.set_link(EntityKind::Product, sp, Some(tomato.id), Some(1.0), true).unwrap();
        assert!(store.set_link(EntityKind::Variety, sp, Some(cherry.id), Some(1.0), true).unwrap());
        assert_eq!(store.source_products_for_canonical(tomato.id).unwrap(), vec![sp]);

        // Relinking the product drops the now-foreign variety
        store.set_link(EntityKind::Product, sp, Some(potato.id), Some(1.0), true).unwrap();
        assert_eq!(store.get_source_entity(sp).unwrap().unwrap().variety_id, None);
    }

    #[test]
    fn test_delete_canonical_with_dependents_is_refused() {
        let store = store();
        let country = store.create_country("az", "Azerbaijan").unwrap();
        assert_eq!(country.iso_code, "AZ");
        let market = store.create_market(country.id, "Baku", None).unwrap();

        assert_eq!(
            store.delete_canonical(EntityKind::Country, country.id).unwrap(),
            DeleteOutcome::HasDependents(1)
        );
        assert_eq!(
            store.delete_canonical(EntityKind::Market, market.id).unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete_canonical(EntityKind::Market, market.id).unwrap(),
            DeleteOutcome::NotFound
        );
        assert_eq!(
            store.delete_canonical(EntityKind::Country, country.id).unwrap(),
            DeleteOutcome::Deleted
        );
    }

    #[test]
    fn test_replace_aggregates_swaps_whole_set() {
        let store = store();
        store.replace_aggregates(1, &[aggregate(1, Some(1), 10.0), aggregate(1, None, 10.0)]).unwrap();
        store.replace_aggregates(2, &[aggregate(2, Some(1), 5.0)]).unwrap();

        store.replace_aggregates(1, &[aggregate(1, Some(2), 12.0)]).unwrap();
        let records = store.aggregates_for_product(1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].period, Some(2));
        assert_eq!(store.aggregates_for_product(2).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_replace_keeps_previous_set() {
        let store = store();
        store.replace_aggregates(1, &[aggregate(1, Some(1), 10.0)]).unwrap();

        // Duplicate key violates the unique constraint mid-transaction
        let duplicate = vec![aggregate(1, Some(3), 1.0), aggregate(1, Some(3), 2.0)];
        assert!(store.replace_aggregates(1, &duplicate).is_err());

        let records = store.aggregates_for_product(1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].period, Some(1));
        assert_eq!(records[0].avg_price, 10.0);
    }

    #[test]
    fn test_annual_period_round_trips_as_none() {
        let store = store();
        store.replace_aggregates(1, &[aggregate(1, None, 3.0)]).unwrap();
        assert_eq!(store.aggregates_for_product(1).unwrap()[0].period, None);
    }

    #[test]
    fn test_rate_table_upsert_and_load() {
        let store = store();
        store.upsert_currency_rate("azn", 1.7).unwrap();
        store.upsert_currency_rate("AZN", 1.71).unwrap();
        store.upsert_unit_rate("100KG", 0.01, "KG").unwrap();
        assert!(store.upsert_currency_rate("XXX", 0.0).is_err());

        let table = store.load_rate_table().unwrap();
        assert_eq!(table.currency("AZN").unwrap().rate_to_base, 1.71);
        assert_eq!(table.unit("100kg").unwrap().base_unit, "kg");
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let store = SqliteCatalogStore::new(&path).unwrap();
            store.create_country("AZ", "Azerbaijan").unwrap();
        }
        let store = SqliteCatalogStore::new(&path).unwrap();
        assert_eq!(store.list_canonical(EntityKind::Country).unwrap().len(), 1);
    }
}
