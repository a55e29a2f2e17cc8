//! End-to-end tests for manual linking and guarded deletes

mod common;

use agri_price_engine::catalog_store::{CatalogStore, EntityKind, PeriodType, SourceKind};
use agri_price_engine::comparison::{ComparisonRequest, PointStatus};
use agri_price_engine::EngineError;
use common::{date, observation, TestEngine};

#[test]
fn test_delete_market_with_linked_source_market_is_refused() {
    let env = TestEngine::new();
    let country = env.engine.create_country("AZ", "Azerbaijan").unwrap();
    let market = env.engine.create_market(country.id, "Baku", None).unwrap();
    let source_market =
        env.register_source(EntityKind::Market, SourceKind::Az, "AZ/BAK", "Baku", None);
    env.engine
        .link_entity(EntityKind::Market, source_market, Some(market.id))
        .unwrap();

    let result = env.engine.delete_canonical(EntityKind::Market, market.id);
    assert!(matches!(
        result,
        Err(EngineError::HasDependents { count: 1, .. })
    ));

    // The country is held by its market as well
    assert!(matches!(
        env.engine.delete_canonical(EntityKind::Country, country.id),
        Err(EngineError::HasDependents { .. })
    ));

    env.engine
        .unlink_entity(EntityKind::Market, source_market)
        .unwrap();
    env.engine
        .delete_canonical(EntityKind::Market, market.id)
        .unwrap();
    assert!(!env
        .store
        .canonical_exists(EntityKind::Market, market.id)
        .unwrap());
}

#[test]
fn test_delete_product_with_aggregates_is_refused() {
    let env = TestEngine::new();
    let (product, source) = env.linked_potato();
    env.insert(&[observation(source, date(2024, 1, 2), 1.0, 1.0, 1.0)]);
    env.engine.recompute_aggregates_for_product(product).unwrap();

    // One link plus weekly, monthly and annual aggregates
    let result = env.engine.delete_canonical(EntityKind::Product, product);
    assert!(matches!(
        result,
        Err(EngineError::HasDependents { count: 4, .. })
    ));
}

#[test]
fn test_unlink_clears_aggregates_and_frees_product() {
    let env = TestEngine::new();
    let (product, source) = env.linked_potato();
    env.insert(&[observation(source, date(2024, 1, 2), 1.0, 1.0, 1.0)]);
    env.engine.recompute_aggregates_for_product(product).unwrap();

    env.engine.unlink_entity(EntityKind::Product, source).unwrap();
    assert!(env.engine.aggregates_for_product(product).unwrap().is_empty());
    env.engine
        .delete_canonical(EntityKind::Product, product)
        .unwrap();
}

#[test]
fn test_relinked_source_moves_aggregates_to_new_product() {
    let env = TestEngine::new();
    let (potato, source) = env.linked_potato();
    let onion = env.create_product(common::ONION);
    env.insert(&[observation(source, date(2024, 3, 5), 10.0, 10.0, 10.0)]);
    env.engine.recompute_aggregates_for_product(potato).unwrap();
    assert_eq!(env.engine.aggregates_for_product(potato).unwrap().len(), 3);

    env.engine
        .link_entity(EntityKind::Product, source, Some(onion))
        .unwrap();
    assert!(env.engine.aggregates_for_product(potato).unwrap().is_empty());
    let onion_records = env.engine.aggregates_for_product(onion).unwrap();
    assert_eq!(onion_records.len(), 3);
    assert!(onion_records.iter().all(|r| r.avg_price == 10.0));

    // Later sweeps keep the old product empty
    let summary = env.engine.recompute_all_aggregates().unwrap();
    assert!(summary.failed.is_empty());
    assert_eq!(env.engine.recompute_aggregates_for_product(potato).unwrap(), 0);
    assert!(env.engine.aggregates_for_product(potato).unwrap().is_empty());

    let comparison = env
        .engine
        .compare(&ComparisonRequest {
            product_ids: vec![potato],
            period_type: PeriodType::Weekly,
            year: Some(2024),
            market_type_code: None,
            currency: "AZN".to_string(),
            unit: "kg".to_string(),
        })
        .unwrap();
    assert!(comparison
        .series
        .iter()
        .all(|s| matches!(s.status, PointStatus::Unavailable { .. })));

    env.engine
        .delete_canonical(EntityKind::Product, potato)
        .unwrap();
}

#[test]
fn test_delete_missing_record_is_not_found() {
    let env = TestEngine::new();
    assert!(matches!(
        env.engine.delete_canonical(EntityKind::PriceStage, 99),
        Err(EngineError::NotFound { id: 99, .. })
    ));
}

#[test]
fn test_link_to_missing_canonical_is_rejected() {
    let env = TestEngine::new();
    let (_, source) = env.linked_potato();
    assert!(matches!(
        env.engine.link_entity(EntityKind::Product, source, Some(777)),
        Err(EngineError::NotFound { id: 777, .. })
    ));
    assert!(matches!(
        env.engine.link_entity(EntityKind::Product, 888, Some(1)),
        Err(EngineError::NotFound { id: 888, .. })
    ));
}

#[test]
fn test_link_of_wrong_source_kind_is_invalid() {
    let env = TestEngine::new();
    let country = env.engine.create_country("GE", "Georgia").unwrap();
    let (_, source_product) = env.linked_potato();
    assert!(matches!(
        env.engine
            .link_entity(EntityKind::Country, source_product, Some(country.id)),
        Err(EngineError::InvalidLink(_))
    ));
}

#[test]
fn test_manual_link_is_recorded() {
    let env = TestEngine::new();
    let (product, source) = env.linked_potato();
    let entity = env.engine.get_source_entity(source).unwrap();
    assert_eq!(entity.canonical_id, Some(product));
    assert!(entity.is_manual);
    assert_eq!(entity.match_score, Some(1.0));
}

#[test]
fn test_variety_link_requires_matching_product() {
    let env = TestEngine::new();
    let (potato, source) = env.linked_potato();
    let onion = env.create_product(common::ONION);
    let red_onion = env.engine.create_variety(onion, "Red").unwrap();
    let new_potato = env.engine.create_variety(potato, "New").unwrap();

    assert!(matches!(
        env.engine
            .link_entity(EntityKind::Variety, source, Some(red_onion.id)),
        Err(EngineError::InvalidLink(_))
    ));

    env.engine
        .link_entity(EntityKind::Variety, source, Some(new_potato.id))
        .unwrap();
    let entity = env.engine.get_source_entity(source).unwrap();
    assert_eq!(entity.variety_id, Some(new_potato.id));
    assert!(entity.variety_is_manual);

    // Moving the product link drops the variety that belonged to the old product
    env.engine
        .link_entity(EntityKind::Product, source, Some(onion))
        .unwrap();
    let entity = env.engine.get_source_entity(source).unwrap();
    assert_eq!(entity.canonical_id, Some(onion));
    assert_eq!(entity.variety_id, None);
}

#[test]
fn test_variety_linked_sources_feed_the_parent_product() {
    let env = TestEngine::new();
    let (potato, source) = env.linked_potato();
    let new_potato = env.engine.create_variety(potato, "New").unwrap();
    env.engine
        .link_entity(EntityKind::Variety, source, Some(new_potato.id))
        .unwrap();
    env.insert(&[observation(source, date(2024, 6, 3), 1.0, 1.0, 1.0)]);

    env.engine.recompute_aggregates_for_product(potato).unwrap();
    let records = env.engine.aggregates_for_product(potato).unwrap();
    assert!(records
        .iter()
        .any(|r| r.period_type == PeriodType::Annual && r.year == 2024));
}
