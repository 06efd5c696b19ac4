//! Metric instrument factories for siakad-queue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"siakad-queue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for siakad-queue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("siakad-queue")
}

/// Counter: broker operations (declare, publish, purge, stats).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("siakad.queue.operations")
        .with_description("Number of broker queue operations")
        .build()
}

/// Counter: delivery settlements.
/// Labels: `queue`, `outcome` ("ack" | "requeue" | "dead_letter").
pub fn deliveries_settled() -> Counter<u64> {
    meter()
        .u64_counter("siakad.queue.deliveries")
        .with_description("Number of settled deliveries by outcome")
        .build()
}

/// Counter: lock operations.
/// Labels: `operation`, `result` ("ok" | "contended").
pub fn lock_operations() -> Counter<u64> {
    meter()
        .u64_counter("siakad.lock.operations")
        .with_description("Number of distributed lock operations")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("siakad.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: outbound notification attempts.
/// Labels: `result` ("ok" | "error").
pub fn notifications_sent() -> Counter<u64> {
    meter()
        .u64_counter("siakad.notify.sent")
        .with_description("Number of outbound email notifications")
        .build()
}
