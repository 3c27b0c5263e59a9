//! Metrics and observability utilities
//!
//! Metric descriptions and recording helpers for the gateway and the import
//! pipeline. Recording goes through the `metrics` facade; installing an
//! exporter is left to the binaries.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Librarium metrics
pub const METRICS_PREFIX: &str = "librarium";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Buckets for whole import jobs, which run for seconds up to an hour
pub const IMPORT_BUCKETS: &[f64] = &[
    0.5,
    1.0,
    5.0,
    15.0,
    60.0,
    300.0,
    900.0,
    1800.0,
    3600.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Import metrics
    describe_counter!(
        format!("{}_import_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Import jobs by terminal status"
    );

    describe_counter!(
        format!("{}_import_rows_total", METRICS_PREFIX),
        Unit::Count,
        "CSV data rows by outcome"
    );

    describe_counter!(
        format!("{}_import_chunks_total", METRICS_PREFIX),
        Unit::Count,
        "Chunk transactions by outcome"
    );

    describe_histogram!(
        format!("{}_import_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Import job wall time in seconds"
    );

    // Queue metrics
    describe_gauge!(
        format!("{}_import_jobs_running", METRICS_PREFIX),
        Unit::Count,
        "Import jobs currently executing"
    );

    describe_counter!(
        format!("{}_import_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Import job runs retried after an error"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a finished chunk: its rows by outcome and whether it committed
pub fn record_chunk(imported: u64, failed: u64, committed: bool) {
    let outcome = if committed { "committed" } else { "rolled_back" };

    counter!(
        format!("{}_import_chunks_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    counter!(
        format!("{}_import_rows_total", METRICS_PREFIX),
        "outcome" => "imported"
    )
    .increment(imported);

    counter!(
        format!("{}_import_rows_total", METRICS_PREFIX),
        "outcome" => "failed"
    )
    .increment(failed);
}

/// Record a job reaching a terminal status
pub fn record_import_job(status: &str, duration_secs: f64) {
    counter!(
        format!("{}_import_jobs_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(format!("{}_import_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Track the number of running import jobs
pub fn record_running_jobs(delta: f64) {
    gauge!(format!("{}_import_jobs_running", METRICS_PREFIX)).increment(delta);
}

pub fn record_import_retry() {
    counter!(format!("{}_import_retries_total", METRICS_PREFIX)).increment(1);
}
