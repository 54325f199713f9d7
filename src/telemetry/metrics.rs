//! Metric instrument factories for workrelay.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workrelay"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workrelay instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workrelay")
}

/// Counter: jobs registered and handed to the transport.
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("workrelay.jobs.submitted")
        .with_description("Number of jobs registered for dispatch")
        .build()
}

/// Counter: terminal job outcomes.
/// Labels: `outcome` ("completed" | "failed" | "timed_out" | "publish_error").
pub fn jobs_resolved() -> Counter<u64> {
    meter()
        .u64_counter("workrelay.jobs.resolved")
        .with_description("Number of jobs that reached a terminal state")
        .build()
}

/// Histogram: time spent held back by an admission gate.
/// Labels: `gate` ("queue_depth" | "memory").
pub fn admission_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workrelay.admission.wait_ms")
        .with_description("Time a job waited for admission")
        .with_unit("ms")
        .build()
}

/// Counter: outbound messages written to blob storage instead of the bus.
pub fn payloads_offloaded() -> Counter<u64> {
    meter()
        .u64_counter("workrelay.payloads.offloaded")
        .with_description("Messages stored out-of-band because of size")
        .build()
}

/// Counter: queue-level operations (send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workrelay.queue.operations")
        .with_description("Number of queue operations")
        .build()
}
