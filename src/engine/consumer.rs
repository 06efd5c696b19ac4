//! Consumer loop engine: one receive loop per registered queue.
//!
//! Each loop holds at most `prefetch` (normally 1) unacknowledged delivery,
//! runs the handler to completion, then settles: ack on success, nack with
//! requeue on failure. Loops for different queues run as independent tasks
//! and never order against each other.

use crate::broker::{Broker, Consumer, Delivery};
use crate::error::{Error, Result};
use crate::registry;
use crate::store::KvStore;
use crate::telemetry::delivery::{record_settlement, start_delivery_span};
use crate::telemetry::metrics;
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, error, info, warn};

use super::handler::Handler;

/// Prefix of the store keys counting failed attempts per message.
pub const REDELIVERY_PREFIX: &str = "redelivery:";

/// Store key counting failed attempts of one message on one queue.
pub fn redelivery_key(queue: &str, message_id: &str) -> String {
    format!("{REDELIVERY_PREFIX}{queue}:{message_id}")
}

/// Where a failing message goes once it has failed too often.
#[derive(Debug, Clone, Copy)]
pub struct DeadLetterPolicy {
    /// Failed deliveries before the message is dead-lettered.
    pub max_attempts: u32,
    /// Lifetime of an idle attempt counter.
    pub counter_ttl: Duration,
}

impl DeadLetterPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            counter_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Configuration for the consumer engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unacknowledged deliveries per queue loop.
    pub prefetch: u16,
    /// None keeps requeueing failed messages forever.
    pub dead_letter: Option<DeadLetterPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            dead_letter: None,
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

impl Settlement {
    pub fn as_str(self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Requeue => "requeue",
            Settlement::DeadLetter => "dead_letter",
        }
    }

    /// Decide what to do with a failed delivery after `attempts` failures.
    pub fn for_failure(attempts: i64, max_attempts: u32) -> Self {
        if attempts >= i64::from(max_attempts) {
            Settlement::DeadLetter
        } else {
            Settlement::Requeue
        }
    }
}

/// Dead-letter queue for `queue`: the registry entry, else `<queue>.dead`.
pub fn dead_letter_queue(queue: &str) -> String {
    registry::spec(queue)
        .and_then(|spec| spec.dead_letter)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{queue}.dead"))
}

/// Owns the handler registrations and drives one loop per queue.
pub struct ConsumerEngine {
    broker: Arc<dyn Broker>,
    store: Option<Arc<dyn KvStore>>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    config: EngineConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Clone for ConsumerEngine {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl ConsumerEngine {
    pub fn new(broker: Arc<dyn Broker>, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            store: None,
            handlers: Vec::new(),
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Store used to count failed attempts. Required for dead-lettering.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register the handler for `queue`, replacing any earlier one.
    pub fn register(&mut self, queue: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.retain(|(name, _)| name != queue);
        self.handlers.push((queue.to_string(), handler));
        self
    }

    /// Queues with a registered handler, in registration order.
    pub fn queues(&self) -> Vec<&str> {
        self.handlers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Signal every loop to stop after its in-flight message settles.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Start every queue loop and wait until all of them have exited.
    ///
    /// Fails only if a consumer cannot be started; once running, delivery
    /// and handler errors are absorbed by the loops.
    pub async fn run(&self) -> Result<()> {
        if self.config.dead_letter.is_some() && self.store.is_none() {
            return Err(Error::Config(
                "dead-letter policy requires a store for attempt counting".to_string(),
            ));
        }

        let mut loops = JoinSet::new();
        for (queue, handler) in &self.handlers {
            let consumer = self.broker.consume(queue, self.config.prefetch).await?;
            let queue_loop = QueueLoop {
                queue: queue.clone(),
                handler: Arc::clone(handler),
                broker: Arc::clone(&self.broker),
                store: self.store.clone(),
                dead_letter: self.config.dead_letter,
            };
            let shutdown = self.shutdown.subscribe();
            loops.spawn(queue_loop.run(consumer, shutdown));
            info!(queue = %queue, prefetch = self.config.prefetch, "waiting for messages");
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("consumer loop aborted: {e}");
            }
        }

        info!("consumer engine stopped");
        Ok(())
    }
}

struct QueueLoop {
    queue: String,
    handler: Arc<dyn Handler>,
    broker: Arc<dyn Broker>,
    store: Option<Arc<dyn KvStore>>,
    dead_letter: Option<DeadLetterPolicy>,
}

impl QueueLoop {
    async fn run(self, mut consumer: Box<dyn Consumer>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the wait for a delivery races shutdown; once a message
            // is checked out it is handled and settled to completion.
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, "consumer error, stopping loop: {e}");
                    break;
                }
                None => {
                    warn!(queue = %self.queue, "consumer closed by broker");
                    break;
                }
            }
        }

        if let Err(e) = consumer.cancel().await {
            warn!(queue = %self.queue, "error cancelling consumer: {e}");
        }
        info!(queue = %self.queue, "consumer loop stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let span = start_delivery_span(&self.queue, delivery.delivery_tag, delivery.redelivered);

        async {
            let start = Instant::now();
            let outcome = match serde_json::from_slice::<serde_json::Value>(&delivery.payload) {
                Ok(message) => {
                    info!(queue = %self.queue, "processing message");
                    AssertUnwindSafe(self.handler.handle(message))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(Error::Handler(format!(
                                "handler panicked: {}",
                                panic_message(&*panic)
                            )))
                        })
                }
                Err(e) => Err(Error::Payload(e)),
            };
            metrics::handler_duration_ms().record(
                start.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("queue", self.queue.clone())],
            );

            let settlement = match outcome {
                Ok(()) => Settlement::Ack,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "error processing message");
                    self.after_failure(&delivery).await
                }
            };

            self.settle(delivery, settlement, &span).await;
        }
        .instrument(span.clone())
        .await
    }

    /// Count the failure and pick requeue or dead-letter.
    async fn after_failure(&self, delivery: &Delivery) -> Settlement {
        let (Some(policy), Some(store), Some(message_id)) =
            (self.dead_letter, &self.store, &delivery.message_id)
        else {
            return Settlement::Requeue;
        };

        let key = redelivery_key(&self.queue, message_id);
        match store.incr(&key, policy.counter_ttl.as_secs()).await {
            Ok(attempts) => Settlement::for_failure(attempts, policy.max_attempts),
            Err(e) => {
                warn!(queue = %self.queue, "cannot count redeliveries, requeueing: {e}");
                Settlement::Requeue
            }
        }
    }

    async fn settle(&self, delivery: Delivery, settlement: Settlement, span: &Span) {
        let message_id = delivery.message_id.clone();

        let applied = match settlement {
            Settlement::Ack => delivery.ack().await.map(|()| Settlement::Ack),
            Settlement::Requeue => delivery.nack(true).await.map(|()| Settlement::Requeue),
            Settlement::DeadLetter => self.dead_letter(delivery).await,
        };

        match applied {
            Ok(outcome) => {
                if matches!(outcome, Settlement::Ack | Settlement::DeadLetter) {
                    self.clear_attempts(message_id.as_deref()).await;
                }
                metrics::deliveries_settled().add(
                    1,
                    &[
                        KeyValue::new("queue", self.queue.clone()),
                        KeyValue::new("outcome", outcome.as_str()),
                    ],
                );
                record_settlement(span, outcome.as_str());
            }
            Err(e) => {
                // The broker keeps the message checked out until the
                // channel closes, then redelivers it.
                error!(queue = %self.queue, "failed to settle delivery: {e}");
                record_settlement(span, "unsettled");
            }
        }
    }

    /// Republish to the dead-letter queue, then ack the original. If the
    /// dead-letter queue will not take it, requeue instead.
    async fn dead_letter(&self, delivery: Delivery) -> Result<Settlement> {
        let target = dead_letter_queue(&self.queue);
        let message_id = delivery
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match self
            .broker
            .send(&target, delivery.payload.clone(), message_id)
            .await
        {
            Ok(true) => {
                warn!(queue = %self.queue, dead_letter = %target, "message dead-lettered");
                delivery.ack().await?;
                Ok(Settlement::DeadLetter)
            }
            Ok(false) => {
                warn!(dead_letter = %target, "dead-letter queue refused message, requeueing");
                delivery.nack(true).await?;
                Ok(Settlement::Requeue)
            }
            Err(e) => {
                warn!(dead_letter = %target, "dead-letter publish failed, requeueing: {e}");
                delivery.nack(true).await?;
                Ok(Settlement::Requeue)
            }
        }
    }

    async fn clear_attempts(&self, message_id: Option<&str>) {
        let (Some(_), Some(store), Some(message_id)) = (self.dead_letter, &self.store, message_id)
        else {
            return;
        };
        if let Err(e) = store.del(&redelivery_key(&self.queue, message_id)).await {
            warn!(queue = %self.queue, "failed to clear redelivery counter: {e}");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
