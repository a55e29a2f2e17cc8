//! End-to-end tests for the scheduled engine jobs on SQLite

mod common;

use agri_price_engine::background_jobs::jobs::{AggregateRecomputeJob, EntityMatchingJob};
use agri_price_engine::background_jobs::{HookEvent, JobContext, JobRunStatus, JobScheduler};
use agri_price_engine::catalog_store::{EntityKind, SourceKind};
use agri_price_engine::PriceEngine;
use common::{date, observation, TestEngine, AZ_POTATO_CODE, AZ_POTATO_NAME, POTATO};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn scheduler_for(
    engine: Arc<PriceEngine>,
) -> (JobScheduler, mpsc::Sender<HookEvent>, CancellationToken) {
    let (hook_sender, hook_receiver) = mpsc::channel(16);
    let token = CancellationToken::new();
    let context = JobContext::new(token.child_token(), engine);
    (
        JobScheduler::new(hook_receiver, token.clone(), context),
        hook_sender,
        token,
    )
}

#[tokio::test]
async fn test_ingest_hook_matches_and_aggregates() {
    let env = TestEngine::new();
    let potato = env.create_product(POTATO);
    let source = env.register_source(
        EntityKind::Product,
        SourceKind::Az,
        AZ_POTATO_CODE,
        AZ_POTATO_NAME,
        None,
    );
    env.insert(&[observation(source, date(2024, 9, 2), 1.0, 1.1, 1.3)]);

    let engine = Arc::new(env.reopen());
    let (mut scheduler, hook_sender, token) = scheduler_for(engine.clone());
    scheduler
        .register_job(Arc::new(EntityMatchingJob::new(
            24,
            vec![EntityKind::Product],
        )))
        .await;
    let runner = tokio::spawn(async move {
        scheduler.run().await;
        scheduler
    });

    hook_sender
        .send(HookEvent::OnObservationsIngested)
        .await
        .unwrap();
    wait_until(|| {
        engine
            .get_source_entity(source)
            .map(|e| e.canonical_id == Some(potato))
            .unwrap_or(false)
    })
    .await;
    token.cancel();
    let scheduler = runner.await.unwrap();

    let record = scheduler.last_run("entity_matching").await.unwrap();
    assert_eq!(record.status, JobRunStatus::Completed);
    assert_eq!(record.triggered_by, "hook:OnObservationsIngested");
}

#[tokio::test]
async fn test_startup_recompute_writes_aggregates() {
    let env = TestEngine::new();
    let (product, source) = env.linked_potato();
    env.insert(&[
        observation(source, date(2024, 9, 2), 1.0, 1.1, 1.3),
        observation(source, date(2024, 9, 20), 1.0, 1.2, 1.4),
    ]);

    let engine = Arc::new(env.reopen());
    let (mut scheduler, _hook_sender, token) = scheduler_for(engine.clone());
    scheduler
        .register_job(Arc::new(AggregateRecomputeJob::new(24, true)))
        .await;
    let runner = tokio::spawn(async move {
        scheduler.run().await;
        scheduler
    });

    wait_until(|| {
        engine
            .aggregates_for_product(product)
            .map(|records| !records.is_empty())
            .unwrap_or(false)
    })
    .await;
    token.cancel();
    let scheduler = runner.await.unwrap();

    // Weeks 36 and 38, September, 2024
    assert_eq!(engine.aggregates_for_product(product).unwrap().len(), 4);
    let record = scheduler.last_run("aggregate_recompute").await.unwrap();
    assert_eq!(record.status, JobRunStatus::Completed);
}
