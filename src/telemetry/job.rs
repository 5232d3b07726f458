//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Start a span covering one job execution on `thing`.
///
/// The `job.status` field is declared empty and filled by [`record_status`].
pub fn start_job_span(thing: &str, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.thing" = thing,
        "job.id" = %job_id,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a coordinator phase transition as an event inside `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from, to, "state_transition");
    });
}

/// Record the status reported upstream for the job.
pub fn record_status(span: &Span, status: &str) {
    span.record("job.status", status);
}
