//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"dropq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

use super::SERVICE_NAME;

fn meter() -> Meter {
    opentelemetry::global::meter(SERVICE_NAME)
}

/// Counter: tasks published to the queue.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("dropq.task.enqueued")
        .with_description("Number of tasks queued")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dropq.task.transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: descriptors moved to quarantine.
pub fn tasks_quarantined() -> Counter<u64> {
    meter()
        .u64_counter("dropq.task.quarantined")
        .with_description("Number of descriptors quarantined")
        .build()
}

/// Histogram: transform duration in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn transform_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dropq.transform.duration_ms")
        .with_description("Transform duration in milliseconds")
        .with_unit("ms")
        .build()
}
