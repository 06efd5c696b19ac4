//! Stats and health reporting over the store and broker.
//!
//! Nothing here fails the caller: a dependency that cannot answer is
//! reported as down, and a queue that cannot be inspected carries an
//! error string in its own entry.

use crate::broker::{Broker, QueueStats};
use crate::registry;
use crate::store::KvStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Down,
}

impl From<bool> for ServiceStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            ServiceStatus::Up
        } else {
            ServiceStatus::Down
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Services {
    pub store: ServiceStatus,
    pub broker: ServiceStatus,
}

/// Composite health of both dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub services: Services,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

/// Stats for one queue, or why they could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsEntry {
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<QueueStats> for QueueStatsEntry {
    fn from(stats: QueueStats) -> Self {
        Self {
            queue: stats.queue,
            message_count: Some(stats.message_count),
            consumer_count: Some(stats.consumer_count),
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct HealthReporter {
    store: Arc<dyn KvStore>,
    broker: Arc<dyn Broker>,
}

impl HealthReporter {
    pub fn new(store: Arc<dyn KvStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Healthy only if the store answers a ping and the broker is connected.
    pub async fn aggregate_health(&self) -> HealthReport {
        let store = self.store.is_healthy().await;
        let broker = self.broker.is_healthy();

        HealthReport {
            status: if store && broker {
                OverallStatus::Healthy
            } else {
                OverallStatus::Unhealthy
            },
            timestamp: Utc::now(),
            services: Services {
                store: store.into(),
                broker: broker.into(),
            },
        }
    }

    pub async fn queue_stats(&self, queue: &str) -> QueueStatsEntry {
        match self.broker.stats(queue).await {
            Ok(stats) => stats.into(),
            Err(e) => QueueStatsEntry {
                queue: queue.to_string(),
                message_count: None,
                consumer_count: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stats for every registry queue, in registry order.
    pub async fn all_queue_stats(&self) -> Vec<QueueStatsEntry> {
        let mut entries = Vec::with_capacity(registry::QUEUES.len());
        for spec in registry::QUEUES {
            entries.push(self.queue_stats(spec.name).await);
        }
        entries
    }
}
