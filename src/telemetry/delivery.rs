//! Delivery span helpers.
//!
//! One span per broker delivery, covering decode, handler, and settlement.

use tracing::Span;

/// Start a span for one delivery.
///
/// The `delivery.outcome` field is declared empty and filled via
/// [`record_settlement`].
pub fn start_delivery_span(queue: &str, delivery_tag: u64, redelivered: bool) -> Span {
    tracing::info_span!(
        "queue.deliver",
        "messaging.destination.name" = queue,
        "delivery.tag" = delivery_tag,
        "delivery.redelivered" = redelivered,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// Record how the delivery was settled and emit an `info` event in its scope.
pub fn record_settlement(span: &Span, outcome: &str) {
    span.record("delivery.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome = outcome, "settled");
    });
}
