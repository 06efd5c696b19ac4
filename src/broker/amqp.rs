//! AMQP 0-9-1 broker client via lapin.
//!
//! Connect opens one connection and one shared channel (publisher confirms
//! enabled) and declares the registry. Queue inspection and purge run on
//! short-lived side channels: the broker closes a channel that touches a
//! missing queue, and the shared one must survive that.

use super::{Acker, Broker, Consumer, Delivery, QueueStats};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl AmqpBroker {
    /// Connect, open the shared channel, and declare every registry queue.
    /// Failure here is fatal at startup.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connection =
            Connection::connect(config.url.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(|e| Error::BrokerUnavailable(format!("failed to connect: {e}")))?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        connection.on_error(move |err| {
            error!("broker connection error: {err}");
            flag.store(false, Ordering::SeqCst);
        });

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let broker = Self {
            connection,
            channel,
            connected,
            closed: AtomicBool::new(false),
        };
        broker.declare_all().await?;

        info!("broker connected");
        Ok(broker)
    }

    /// Close the channel, then the connection. Logs instead of failing so
    /// shutdown always completes. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.channel.close(200, "worker shutdown").await {
            warn!("error closing broker channel: {e}");
        }
        if let Err(e) = self.connection.close(200, "worker shutdown").await {
            warn!("error closing broker connection: {e}");
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("broker disconnected");
    }

    async fn side_channel(&self) -> Result<Channel> {
        Ok(self.connection.create_channel().await?)
    }
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(name, durable(), FieldTable::default())
            .await?;
        count(name, "declare");
        Ok(())
    }

    async fn send(&self, queue: &str, payload: Vec<u8>, message_id: String) -> Result<bool> {
        self.declare_queue(queue).await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_message_id(message_id.into());

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        count(queue, "publish");

        Ok(!confirmation.is_nack())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let channel = self.side_channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        // A failed passive declare has already closed the channel.
        let _ = channel.close(200, "stats").await;
        let declared = declared?;
        count(queue, "stats");

        Ok(QueueStats {
            queue: queue.to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        let channel = self.side_channel().await?;
        let purged = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await;
        let _ = channel.close(200, "purge").await;
        let purged = purged?;
        count(queue, "purge");
        info!(queue, purged, "queue purged");
        Ok(purged)
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>> {
        self.declare_queue(queue).await?;
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("{queue}-{}", Uuid::new_v4());
        let inner = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        count(queue, "consume");

        Ok(Box::new(AmqpConsumer {
            queue: queue.to_string(),
            tag,
            channel: self.channel.clone(),
            inner,
        }))
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.connection.status().connected()
            && self.channel.status().connected()
    }
}

struct AmqpConsumer {
    queue: String,
    tag: String,
    channel: Channel,
    inner: lapin::Consumer,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let delivery = match self.inner.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(Error::Broker(e))),
        };

        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        Some(Ok(Delivery::new(
            self.queue.clone(),
            delivery.delivery_tag,
            message_id,
            delivery.redelivered,
            delivery.data,
            Box::new(AmqpAcker(delivery.acker)),
        )))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
