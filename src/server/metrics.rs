use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all dispatch metrics
const PREFIX: &str = "dispatch";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Scheduling Metrics
    pub static ref CLAIMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_claims_total"), "Work polls by outcome"),
        &["outcome"]
    ).expect("Failed to create claims_total metric");

    pub static ref JOBS_CREATED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_created_total"),
        "Total jobs created"
    ).expect("Failed to create jobs_created_total metric");

    pub static ref FAILURES_REPORTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_failures_reported_total"),
        "Total failure webhooks applied to a job"
    ).expect("Failed to create failures_reported_total metric");

    pub static ref JOBS_FAILED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_failed_total"),
        "Jobs that ran out of attempts"
    ).expect("Failed to create jobs_failed_total metric");

    // Checkpoint Retention Metrics
    pub static ref CHECKPOINTS_DELETED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_checkpoints_deleted_total"),
        "Checkpoints removed by retention"
    ).expect("Failed to create checkpoints_deleted_total metric");

    pub static ref CHECKPOINT_DELETE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_checkpoint_delete_failures_total"),
        "Checkpoint deletions that failed"
    ).expect("Failed to create checkpoint_delete_failures_total metric");

    // Error Metrics
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_errors_total"), "Total errors returned to callers"),
        &["error_type", "endpoint"]
    ).expect("Failed to create errors_total metric");

    // System Metrics
    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Claim outcomes recorded by [`record_claim`].
pub mod claim_outcome {
    pub const CLAIMED: &str = "claimed";
    pub const RECLAIMED: &str = "reclaimed";
    pub const EMPTY: &str = "empty";
    pub const RACE_LOST: &str = "race_lost";
    pub const BANNED_SKIP: &str = "banned_skip";
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(CLAIMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FAILURES_REPORTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHECKPOINTS_DELETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHECKPOINT_DELETE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

const STATIC_ENDPOINTS: [&str; 8] = [
    "/",
    "/job",
    "/jobs",
    "/work",
    "/work/peek",
    "/progress",
    "/complete",
    "/fail",
];

/// Route template for a request path, so per-job paths share one label and
/// unknown paths cannot blow up label cardinality.
pub fn endpoint_label(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["job", _] => "/job/{id}".to_string(),
        ["job", _, action @ ("stop" | "events")] => format!("/job/{{id}}/{}", action),
        ["heartbeat", _] => "/heartbeat/{id}".to_string(),
        _ if STATIC_ENDPOINTS.contains(&path) => path.to_string(),
        _ => "unmatched".to_string(),
    }
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Record the outcome of one claim attempt
pub fn record_claim(outcome: &str) {
    CLAIMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_job_created() {
    JOBS_CREATED_TOTAL.inc();
}

/// Record a failure report, and whether it exhausted the job's attempts
pub fn record_failure_reported(exhausted: bool) {
    FAILURES_REPORTED_TOTAL.inc();
    if exhausted {
        JOBS_FAILED_TOTAL.inc();
    }
}

/// Record the result of a checkpoint retention pass
pub fn record_checkpoint_gc(deleted: usize, failed: usize) {
    CHECKPOINTS_DELETED_TOTAL.inc_by(deleted as f64);
    CHECKPOINT_DELETE_FAILURES_TOTAL.inc_by(failed as f64);
}

/// Record an error
pub fn record_error(error_type: &str, endpoint: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, endpoint])
        .inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok());
            if let Some(kb) = rss_kb {
                PROCESS_MEMORY_BYTES.set(kb * 1024.0);
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
