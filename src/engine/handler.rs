//! The callback a queue loop dispatches each decoded message to.

use crate::error::Result;
use async_trait::async_trait;

/// Processes one message from a queue.
///
/// `Ok` acknowledges the message. `Err` sends it back for redelivery, or to
/// the dead-letter queue once a configured attempt limit is reached.
/// Delivery is at-least-once, so handlers should tolerate repeats.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: serde_json::Value) -> Result<()>;
}
