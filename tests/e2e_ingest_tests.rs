//! End-to-end tests: JSON feed records through ingestion, matching,
//! aggregation and comparison

mod common;

use agri_price_engine::catalog_store::{EntityKind, PeriodType, SourceKind, UnlinkedFilter};
use agri_price_engine::comparison::{ComparisonRequest, PointStatus};
use agri_price_engine::sources::SourceRecord;
use common::{TestEngine, POTATO, WHEAT};

const FEED: &str = r#"[
    {
        "source": "AZ",
        "product_code": "0701",
        "product_name": "Potato",
        "local_name": "Kartof",
        "region_code": "BAK",
        "region_name": "Baku",
        "price_stage": "Retail",
        "date": "2024-03-04",
        "min_price": 0.9,
        "avg_price": 1.0,
        "max_price": 1.2
    },
    {
        "source": "AZ",
        "product_code": "0701",
        "product_name": "Potato",
        "region_code": "GAN",
        "region_name": "Ganja",
        "price_stage": "Retail",
        "date": "2024-03-11",
        "avg_price": 1.4
    },
    {
        "source": "AZ",
        "product_code": "0701",
        "product_name": "Potato",
        "price_stage": "Retail",
        "date": "2024-03-12",
        "avg_price": -3.0
    },
    {
        "source": "EU",
        "product_code": "POT",
        "product_label": "Potatoes",
        "member_state": "DE",
        "member_state_name": "Germany",
        "price_type": "Selling price",
        "period_start": "2024-03-01",
        "price": 30.0
    },
    {
        "source": "FAO",
        "item_code": "15",
        "item": "Wheat",
        "area_code": "AZ",
        "area": "Azerbaijan",
        "element": "Producer Price (USD/tonne)",
        "year": 2023,
        "value": 250.0,
        "currency": "USD"
    }
]"#;

fn parse_feed() -> Vec<SourceRecord> {
    serde_json::from_str(FEED).unwrap()
}

#[test]
fn test_feed_ingestion_registers_entities_once() {
    let env = TestEngine::new();

    let summary = env.engine.ingest_records(&parse_feed()).unwrap();

    assert_eq!(summary.observations, 4);
    assert_eq!(summary.skipped, 1);
    // AZ potato, EU potatoes, FAO wheat
    assert_eq!(summary.source_products.len(), 3);

    let products = env
        .engine
        .list_unlinked(EntityKind::Product, &UnlinkedFilter::default())
        .unwrap();
    assert_eq!(products.len(), 3);
    let markets = env
        .engine
        .list_unlinked(
            EntityKind::Market,
            &UnlinkedFilter {
                source: Some(SourceKind::Az),
                ..Default::default()
            },
        )
        .unwrap();
    let mut market_codes: Vec<&str> = markets.iter().map(|m| m.external_code.as_str()).collect();
    market_codes.sort();
    assert_eq!(market_codes, vec!["AZ/BAK", "AZ/GAN"]);

    // Re-ingesting the same feed adds observations, not entities
    env.engine.ingest_records(&parse_feed()).unwrap();
    let products_again = env
        .engine
        .list_unlinked(EntityKind::Product, &UnlinkedFilter::default())
        .unwrap();
    assert_eq!(products_again.len(), 3);
}

#[test]
fn test_feed_to_comparison() {
    let env = TestEngine::new();
    env.seed_rates();
    let potato = env.create_product(POTATO);
    let wheat = env.create_product(WHEAT);

    let summary = env.engine.ingest_records(&parse_feed()).unwrap();
    let matched = env.engine.run_matching(EntityKind::Product).unwrap();
    // "Potatoes" stays for review
    assert_eq!(matched.matched, 2);

    let eu_products = env
        .engine
        .list_unlinked(
            EntityKind::Product,
            &UnlinkedFilter {
                source: Some(SourceKind::Eu),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(eu_products.len(), 1);
    env.engine
        .link_entity(EntityKind::Product, eu_products[0].id, Some(potato))
        .unwrap();

    let recomputed = env
        .engine
        .recompute_for_source_products(&summary.source_products)
        .unwrap();
    assert_eq!(recomputed.products_processed, 2);
    assert!(recomputed.failed.is_empty());

    // FAO annual figure lands on the first of January
    let wheat_records = env.engine.aggregates_for_product(wheat).unwrap();
    let wheat_annual: Vec<_> = wheat_records
        .iter()
        .filter(|r| r.period_type == PeriodType::Annual)
        .collect();
    assert_eq!(wheat_annual.len(), 1);
    assert_eq!(wheat_annual[0].year, 2023);
    assert_eq!(wheat_annual[0].market_type_code, "PRODUCER");
    assert_eq!(wheat_annual[0].unit, "t");

    let comparison = env
        .engine
        .compare(&ComparisonRequest {
            product_ids: vec![potato, wheat],
            period_type: PeriodType::Monthly,
            year: Some(2024),
            market_type_code: None,
            currency: "USD".to_string(),
            unit: "kg".to_string(),
        })
        .unwrap();

    let potato_series: Vec<_> = comparison
        .series
        .iter()
        .filter(|s| s.product_id == potato)
        .collect();
    assert_eq!(potato_series.len(), 2);

    let producer = potato_series
        .iter()
        .find(|s| s.market_type_code.as_deref() == Some("PRODUCER"))
        .unwrap();
    // 30 EUR per 100kg
    let expected = 30.0 / 0.92 * 0.01;
    assert!((producer.points[0].avg_price.unwrap() - expected).abs() < 1e-9);

    let retail = potato_series
        .iter()
        .find(|s| s.market_type_code.as_deref() == Some("RETAIL"))
        .unwrap();
    assert_eq!(retail.points.len(), 1);
    assert_eq!(retail.points[0].sample_count, 2);
    // Mean of 1.0 and 1.4 AZN per kg
    let expected = 1.2 / 1.7;
    assert!((retail.points[0].avg_price.unwrap() - expected).abs() < 1e-9);
    assert!((retail.points[0].min_price.unwrap() - 0.9 / 1.7).abs() < 1e-9);

    // Wheat only has 2023 data
    let wheat_series: Vec<_> = comparison
        .series
        .iter()
        .filter(|s| s.product_id == wheat)
        .collect();
    assert_eq!(wheat_series.len(), 1);
    assert_eq!(wheat_series[0].market_type_code, None);
    assert!(matches!(
        wheat_series[0].status,
        PointStatus::Unavailable { .. }
    ));
}

#[test]
fn test_canonical_reference_prelinks_source_product() {
    let env = TestEngine::new();
    let potato = env.create_product(POTATO);
    let records: Vec<SourceRecord> = serde_json::from_str(&format!(
        r#"[{{
            "source": "AZ",
            "product_code": "KRT",
            "product_name": "Kartof yerli",
            "price_stage": "topdan",
            "date": "2024-07-01",
            "avg_price": 0.8,
            "canonical_product_id": {}
        }}]"#,
        potato
    ))
    .unwrap();

    let summary = env.engine.ingest_records(&records).unwrap();
    let entity = env
        .engine
        .get_source_entity(summary.source_products[0])
        .unwrap();
    assert_eq!(entity.canonical_id, Some(potato));
    assert!(!entity.is_manual);

    env.engine.recompute_aggregates_for_product(potato).unwrap();
    let records = env.engine.aggregates_for_product(potato).unwrap();
    assert!(records.iter().all(|r| r.market_type_code == "WHOLESALE"));
    assert_eq!(records.len(), 3);
}
