//! Integration tests for telemetry initialization and span helpers.

use thing_jobs::model::JobId;
use thing_jobs::telemetry::{TelemetryConfig, init_telemetry, job, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "thing-jobs-test".to_string(),
        log_level: "debug".to_string(),
    };
    // May return Err if another test already set a global subscriber.
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn job_span_records_transition_and_status() {
    let span = job::start_job_span("thing-1", &JobId::from("job-1"));
    job::record_state_transition(&span, "starting", "working");
    job::record_status(&span, "SUCCEEDED");
}

#[test]
fn instruments_work_without_a_meter_provider() {
    metrics::start_requests().add(1, &[]);
    metrics::events_coalesced().add(1, &[]);
    metrics::execution_duration_ms().record(12.5, &[]);
}
