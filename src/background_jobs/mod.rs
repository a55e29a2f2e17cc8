//! Background job scheduling and execution system.
//!
//! Runs the periodic and hook-triggered engine tasks: entity matching and
//! aggregate recompute.

mod context;
mod job;
pub mod jobs;
mod scheduler;

pub use context::JobContext;
pub use job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior};
pub use scheduler::{JobRunRecord, JobRunStatus, JobScheduler};
