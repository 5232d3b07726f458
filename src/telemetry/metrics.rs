//! Metric instruments for the jobs agent.
//!
//! Created from the global `"thing-jobs"` meter; they are no-ops until
//! [`init_telemetry`](super::init_telemetry) installs an OTLP meter provider.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("thing-jobs")
}

/// Counter: start-next requests issued.
pub fn start_requests() -> Counter<u64> {
    meter()
        .u64_counter("jobs.start_requests")
        .with_description("Number of start-next requests issued")
        .build()
}

/// Counter: job executions finished locally.
/// Labels: `status` ("SUCCEEDED" | "FAILED" | ...).
pub fn executions() -> Counter<u64> {
    meter()
        .u64_counter("jobs.executions")
        .with_description("Number of job executions run to completion")
        .build()
}

/// Counter: work-available signals folded into an already pending retry.
pub fn events_coalesced() -> Counter<u64> {
    meter()
        .u64_counter("jobs.events_coalesced")
        .with_description("Work-available signals coalesced while busy")
        .build()
}

/// Counter: requests rejected by the jobs service.
/// Labels: `operation`.
pub fn requests_rejected() -> Counter<u64> {
    meter()
        .u64_counter("jobs.requests_rejected")
        .with_description("Number of requests rejected by the jobs service")
        .build()
}

/// Histogram: local execution time per job in milliseconds.
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobs.execution.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
