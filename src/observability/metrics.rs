use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Run metrics
    pub static ref RUNS_STARTED: IntCounterVec = IntCounterVec::new(
        Opts::new("etl_runs_started_total", "Source runs started"),
        &["source"]
    ).unwrap();

    pub static ref RECORDS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("etl_records_processed_total", "Records merged by successful runs"),
        &["source"]
    ).unwrap();

    pub static ref RUN_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "etl_run_duration_seconds",
            "Source run duration"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["source"]
    ).unwrap();

    pub static ref JOB_STATUS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("etl_job_status", "Last run outcome (1=success, 0=failure)"),
        &["source"]
    ).unwrap();

    // Record metrics
    pub static ref VALIDATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("etl_validation_failures_total", "Records skipped by validation"),
        &["source"]
    ).unwrap();

    pub static ref DRIFT_WARNINGS: IntCounterVec = IntCounterVec::new(
        Opts::new("etl_schema_drift_warnings_total", "Schema drift warnings"),
        &["source"]
    ).unwrap();

    // Storage metrics
    pub static ref CONCURRENCY_CONFLICTS: IntCounter = IntCounter::new(
        "etl_concurrency_conflicts_total",
        "Staged entities re-merged after a concurrent commit"
    ).unwrap();
}

static REGISTER: Once = Once::new();

pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(RUNS_STARTED.clone()),
            Box::new(RECORDS_PROCESSED.clone()),
            Box::new(RUN_DURATION.clone()),
            Box::new(JOB_STATUS.clone()),
            Box::new(VALIDATION_FAILURES.clone()),
            Box::new(DRIFT_WARNINGS.clone()),
            Box::new(CONCURRENCY_CONFLICTS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Metric registration failed");
            }
        }
    });
}

pub fn record_run_start(source: &str) {
    RUNS_STARTED.with_label_values(&[source]).inc();
}

pub fn record_validation_failure(source: &str) {
    VALIDATION_FAILURES.with_label_values(&[source]).inc();
}

pub fn record_drift_warning(source: &str) {
    DRIFT_WARNINGS.with_label_values(&[source]).inc();
}

pub fn record_run_end(source: &str, succeeded: bool, records: u64, duration: Duration) {
    JOB_STATUS.with_label_values(&[source]).set(i64::from(succeeded));
    RUN_DURATION.with_label_values(&[source]).observe(duration.as_secs_f64());
    if succeeded {
        RECORDS_PROCESSED.with_label_values(&[source]).inc_by(records);
    }
}

/// Prometheus text exposition of every registered metric.
pub fn metrics_text() -> String {
    register_metrics();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Metric encoding failed");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
