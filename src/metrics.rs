use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all engine metrics
const PREFIX: &str = "agriprice";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Aggregation Metrics
    pub static ref AGGREGATES_WRITTEN_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_aggregates_written_total"), "Aggregate records written"),
        &["period_type"]
    ).expect("Failed to create aggregates_written_total metric");

    pub static ref AGGREGATION_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_aggregation_failures_total"), "Failed aggregation attempts"),
        &["outcome"]
    ).expect("Failed to create aggregation_failures_total metric");

    pub static ref AGGREGATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_aggregation_duration_seconds"),
            "Time spent recomputing aggregates"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["scope"]
    ).expect("Failed to create aggregation_duration_seconds metric");

    // Matching Metrics
    pub static ref MATCHING_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_matching_outcomes_total"), "Entity matching outcomes"),
        &["kind", "outcome"]
    ).expect("Failed to create matching_outcomes_total metric");

    // Conversion Metrics
    pub static ref CONVERSION_WARNINGS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_conversion_warnings_total"), "Conversions that fell back to the original value"),
        &["reason"]
    ).expect("Failed to create conversion_warnings_total metric");

    // Ingestion Metrics
    pub static ref OBSERVATIONS_INGESTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_observations_ingested_total"), "Raw observations stored"),
        &["source"]
    ).expect("Failed to create observations_ingested_total metric");

    // Background Job Metrics
    pub static ref BACKGROUND_JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_background_job_executions_total"), "Background job executions"),
        &["job_id", "status"]
    ).expect("Failed to create background_job_executions_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");

    pub static ref BACKGROUND_JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_background_job_running"), "Whether a background job is running"),
        &["job_id"]
    ).expect("Failed to create background_job_running metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(AGGREGATES_WRITTEN_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(AGGREGATION_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(AGGREGATION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(MATCHING_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CONVERSION_WARNINGS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(OBSERVATIONS_INGESTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNNING.clone()));

    tracing::debug!("Metrics system initialized");
}

pub fn record_aggregates_written(period_type: &str, count: usize) {
    AGGREGATES_WRITTEN_TOTAL
        .with_label_values(&[period_type])
        .inc_by(count as f64);
}

/// `outcome` is "retried" for a failed attempt that will be tried again and
/// "exhausted" when a product gave up.
pub fn record_aggregation_failure(outcome: &str) {
    AGGREGATION_FAILURES_TOTAL
        .with_label_values(&[outcome])
        .inc();
}

pub fn record_aggregation_duration(scope: &str, duration: Duration) {
    AGGREGATION_DURATION_SECONDS
        .with_label_values(&[scope])
        .observe(duration.as_secs_f64());
}

pub fn record_matching_outcome(kind: &str, outcome: &str) {
    MATCHING_OUTCOMES_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
}

pub fn record_conversion_warning(reason: &str) {
    CONVERSION_WARNINGS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_observations_ingested(source: &str, count: usize) {
    OBSERVATIONS_INGESTED_TOTAL
        .with_label_values(&[source])
        .inc_by(count as f64);
}

pub fn record_background_job_execution(job_id: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    BACKGROUND_JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_background_job_running(job_id: &str, running: bool) {
    BACKGROUND_JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

/// Render every registered metric in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
