//! Entity matching background job.
//!
//! Runs the matcher over the configured entity kinds so newly ingested
//! source entities get linked without operator action.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::catalog_store::EntityKind;
use std::time::Duration;
use tracing::{info, warn};

pub struct EntityMatchingJob {
    interval: Duration,
    kinds: Vec<EntityKind>,
}

impl EntityMatchingJob {
    pub fn new(interval_hours: u64, kinds: Vec<EntityKind>) -> Self {
        Self {
            interval: Duration::from_secs(interval_hours * 60 * 60),
            kinds,
        }
    }
}

impl BackgroundJob for EntityMatchingJob {
    fn id(&self) -> &'static str {
        "entity_matching"
    }

    fn name(&self) -> &'static str {
        "Entity Matching"
    }

    fn description(&self) -> &'static str {
        "Auto-link unlinked source entities to canonical records"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnObservationsIngested],
        }
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let mut failed_kinds = Vec::new();
        // Variety and market candidates are scoped by product and country
        // links, so kinds run in the configured order
        for kind in &self.kinds {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            match ctx.engine.run_matching(*kind) {
                Ok(summary) => info!(
                    "Matched {} {} entit(ies), {} left for review",
                    summary.matched, kind, summary.unmatched
                ),
                Err(e) => {
                    warn!("Matching {} failed: {}", kind, e);
                    failed_kinds.push(kind.to_string());
                }
            }
        }

        if failed_kinds.is_empty() {
            Ok(())
        } else {
            Err(JobError::ExecutionFailed(format!(
                "matching failed for: {}",
                failed_kinds.join(", ")
            )))
        }
    }
}
