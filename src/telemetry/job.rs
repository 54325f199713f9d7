//! Job span helpers.
//!
//! One span per admitted job, covering both admission gates, the publish,
//! and the wait for the worker's reply.

use tracing::Span;

use crate::error::Result;
use crate::job::JobId;

/// Start a span for one job's trip through a processor queue.
///
/// The `job.outcome` field is declared empty and filled by
/// [`record_job_outcome`].
pub fn start_job_span(processor: &str, id: &JobId) -> Span {
    tracing::info_span!(
        "job.dispatch",
        "job.processor" = processor,
        "job.id" = %id,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how the job ended on its span.
pub fn record_job_outcome<T>(span: &Span, outcome: &Result<T>) {
    match outcome {
        Ok(_) => {
            span.record("job.outcome", "completed");
        }
        Err(e) => {
            span.record("job.outcome", format!("{:?}", e.kind()).as_str());
            span.in_scope(|| {
                tracing::debug!(error = %e, "job did not complete");
            });
        }
    }
}
