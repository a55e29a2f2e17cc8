//! Aggregate recompute background job.
//!
//! Regenerates the weekly, monthly and annual aggregates of every canonical
//! product with linked source products.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior},
};
use std::time::Duration;
use tracing::{info, warn};

pub struct AggregateRecomputeJob {
    interval: Duration,
    on_startup: bool,
}

impl AggregateRecomputeJob {
    pub fn new(interval_hours: u64, on_startup: bool) -> Self {
        Self {
            interval: Duration::from_secs(interval_hours * 60 * 60),
            on_startup,
        }
    }
}

impl BackgroundJob for AggregateRecomputeJob {
    fn id(&self) -> &'static str {
        "aggregate_recompute"
    }

    fn name(&self) -> &'static str {
        "Aggregate Recompute"
    }

    fn description(&self) -> &'static str {
        "Regenerate period aggregates of every linked canonical product"
    }

    fn schedule(&self) -> JobSchedule {
        let mut hooks = vec![HookEvent::OnObservationsIngested];
        if self.on_startup {
            hooks.push(HookEvent::OnStartup);
        }
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks,
        }
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::WaitForCompletion
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let summary = ctx
            .engine
            .recompute_all_aggregates()
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        info!(
            "Recomputed {} aggregate(s) for {} product(s)",
            summary.total, summary.products_processed
        );
        if !summary.failed.is_empty() {
            warn!(
                "Aggregation gave up on {} product(s): {:?}",
                summary.failed.len(),
                summary.failed
            );
            return Err(JobError::ExecutionFailed(format!(
                "{} product(s) failed",
                summary.failed.len()
            )));
        }
        Ok(())
    }
}
