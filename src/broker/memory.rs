//! In-process [`Broker`] for tests and single-node development.
//!
//! Mirrors the broker semantics the engine relies on: per-consumer
//! prefetch, checked-out messages that only leave on ack, nack-requeue to
//! the head of the queue with the redelivered flag set, purge of ready
//! messages only, and redelivery of everything checked out when the
//! connection drops.

use super::{Acker, Broker, Consumer, Delivery, QueueStats};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
struct Stored {
    message_id: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    consumers: u32,
    notify: Arc<Notify>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    connected: AtomicBool,
    max_depth: Option<usize>,
}

impl Inner {
    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>> {
        self.queues
            .lock()
            .map_err(|_| Error::Other("memory broker state poisoned".to_string()))
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("memory broker is disconnected".to_string()))
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A broker that refuses publishes once a queue holds `max_depth` ready messages.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self::build(Some(max_depth))
    }

    fn build(max_depth: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                max_depth,
            }),
        }
    }

    /// Simulate the connection dropping or coming back.
    ///
    /// On disconnect every checked-out message returns to the head of its
    /// queue and all waiting consumers observe a closed stream.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
        if connected {
            return;
        }
        if let Ok(mut queues) = self.inner.queues() {
            for state in queues.values_mut() {
                let mut returned: Vec<(u64, Stored)> = state.unacked.drain().collect();
                returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                for (_, mut msg) in returned {
                    msg.redelivered = true;
                    state.ready.push_front(msg);
                }
                state.notify.notify_waiters();
            }
        }
    }

    /// Number of deliveries currently checked out from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues()
            .ok()
            .and_then(|queues| queues.get(queue).map(|s| s.unacked.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.inner.check_connected()?;
        self.inner.queues()?.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, payload: Vec<u8>, message_id: String) -> Result<bool> {
        self.inner.check_connected()?;
        let mut queues = self.inner.queues()?;
        let state = queues.entry(queue.to_string()).or_default();
        if self
            .inner
            .max_depth
            .is_some_and(|max| state.ready.len() >= max)
        {
            return Ok(false);
        }
        state.ready.push_back(Stored {
            message_id,
            payload,
            redelivered: false,
        });
        state.notify.notify_one();
        Ok(true)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.inner.check_connected()?;
        let queues = self.inner.queues()?;
        let state = queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        Ok(QueueStats {
            queue: queue.to_string(),
            message_count: state.ready.len() as u32,
            consumer_count: state.consumers,
        })
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        self.inner.check_connected()?;
        let mut queues = self.inner.queues()?;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        let purged = state.ready.len() as u32;
        state.ready.clear();
        Ok(purged)
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>> {
        self.inner.check_connected()?;
        let notify = {
            let mut queues = self.inner.queues()?;
            let state = queues.entry(queue.to_string()).or_default();
            state.consumers += 1;
            Arc::clone(&state.notify)
        };

        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
            notify,
            active: true,
        }))
    }

    fn is_healthy(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    /// One permit per allowed unacknowledged delivery.
    permits: Arc<Semaphore>,
    notify: Arc<Notify>,
    active: bool,
}

impl MemoryConsumer {
    fn take_ready(&self, permit: OwnedSemaphorePermit) -> Result<std::result::Result<Delivery, OwnedSemaphorePermit>> {
        let mut queues = self.inner.queues()?;
        let Some(state) = queues.get_mut(&self.queue) else {
            return Ok(Err(permit));
        };
        let Some(msg) = state.ready.pop_front() else {
            return Ok(Err(permit));
        };

        let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
        state.unacked.insert(tag, msg.clone());

        Ok(Ok(Delivery::new(
            self.queue.clone(),
            tag,
            Some(msg.message_id),
            msg.redelivered,
            msg.payload,
            Box::new(MemoryAcker {
                inner: Arc::clone(&self.inner),
                queue: self.queue.clone(),
                tag,
                _permit: permit,
            }),
        )))
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Ok(mut queues) = self.inner.queues() {
            if let Some(state) = queues.get_mut(&self.queue) {
                state.consumers = state.consumers.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let mut permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        loop {
            if !self.active || !self.inner.connected.load(Ordering::SeqCst) {
                return None;
            }
            let notified = self.notify.notified();
            match self.take_ready(permit) {
                Ok(Ok(delivery)) => return Some(Ok(delivery)),
                Ok(Err(returned)) => permit = returned,
                Err(e) => return Some(Err(e)),
            }
            notified.await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.detach();
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
    /// Held until the delivery is settled, bounding in-flight deliveries.
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn checked_out(&self, queues: &mut HashMap<String, QueueState>) -> Result<Stored> {
        queues
            .get_mut(&self.queue)
            .and_then(|state| state.unacked.remove(&self.tag))
            .ok_or_else(|| {
                Error::BrokerUnavailable(format!(
                    "unknown delivery tag {} on {}",
                    self.tag, self.queue
                ))
            })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.check_connected()?;
        let mut queues = self.inner.queues()?;
        self.checked_out(&mut queues)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.inner.check_connected()?;
        let mut queues = self.inner.queues()?;
        let mut msg = self.checked_out(&mut queues)?;
        if requeue {
            if let Some(state) = queues.get_mut(&self.queue) {
                msg.redelivered = true;
                state.ready.push_front(msg);
                state.notify.notify_one();
            }
        }
        Ok(())
    }
}
