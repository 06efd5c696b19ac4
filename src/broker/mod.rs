//! Queue broker client.
//!
//! [`Broker`] declares durable queues, publishes persistent messages, and
//! hands out [`Consumer`]s whose [`Delivery`]s stay checked out until they
//! are acked or nacked. [`AmqpBroker`] speaks AMQP 0-9-1 over a single
//! shared channel; [`MemoryBroker`] keeps the same contract in-process.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use crate::error::Result;
use crate::registry;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

/// Depth and consumer count of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Ensure a durable queue exists. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Hand an already-serialized persistent message to the broker.
    ///
    /// Returns false when the broker refuses the write. Never retries.
    async fn send(&self, queue: &str, payload: Vec<u8>, message_id: String) -> Result<bool>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Drop every ready (not checked-out) message. Returns how many went.
    async fn purge(&self, queue: &str) -> Result<u32>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>>;

    /// Last known connection state. No round trip.
    fn is_healthy(&self) -> bool;

    /// Declare every registry queue and its dead-letter queue.
    async fn declare_all(&self) -> Result<()> {
        for name in registry::declared_names() {
            self.declare_queue(name).await?;
            info!(queue = name, "queue declared");
        }
        Ok(())
    }

    /// Serialize `message` as JSON and publish it with a fresh message id.
    ///
    /// Failures are logged and reported as `false`, never raised.
    async fn publish(&self, queue: &str, message: &serde_json::Value) -> bool {
        let payload = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(queue, "failed to serialize message: {e}");
                return false;
            }
        };
        match self.send(queue, payload, Uuid::new_v4().to_string()).await {
            Ok(accepted) => {
                info!(queue, accepted, "message published");
                accepted
            }
            Err(e) => {
                error!(queue, "error publishing message: {e}");
                false
            }
        }
    }
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. None once the consumer is closed.
    async fn next(&mut self) -> Option<Result<Delivery>>;

    /// Stop receiving. Deliveries already handed out still need settling.
    async fn cancel(&mut self) -> Result<()>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message checked out to this consumer.
///
/// Settling consumes the delivery, so each one is acked or nacked at most once.
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        delivery_tag: u64,
        message_id: Option<String>,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            queue: queue.into(),
            delivery_tag,
            message_id,
            redelivered,
            payload,
            acker,
        }
    }

    /// Remove the message from the queue permanently.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message, returning it to the queue when `requeue` is set.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
