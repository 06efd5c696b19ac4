//! Consumer engine behaviour over the in-process broker and store.

use async_trait::async_trait;
use serde_json::{Value, json};
use siakad_queue::broker::{Broker, MemoryBroker};
use siakad_queue::engine::consumer::{dead_letter_queue, redelivery_key};
use siakad_queue::engine::{ConsumerEngine, DeadLetterPolicy, EngineConfig, Handler, Settlement};
use siakad_queue::error::{Error, Result};
use siakad_queue::store::{KvStore, MemoryStore};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records every message and fails the first `failures` calls.
#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
    failures: usize,
    delay: Duration,
    seen: Mutex<Vec<Value>>,
}

impl Recorder {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            ..Default::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, message: Value) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().unwrap().push(message);
        if call < self.failures {
            Err(Error::Handler(format!("induced failure {call}")))
        } else {
            Ok(())
        }
    }
}

fn start(engine: &ConsumerEngine) -> JoinHandle<Result<()>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.run().await })
}

async fn stop(engine: &ConsumerEngine, handle: JoinHandle<Result<()>>) {
    engine.shutdown();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();
}

/// Poll `check` until it holds or the wait runs out.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn depth(broker: &MemoryBroker, queue: &str) -> u32 {
    broker.stats(queue).await.map(|s| s.message_count).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[test]
fn failure_settlement_respects_attempt_limit() {
    assert_eq!(Settlement::for_failure(1, 3), Settlement::Requeue);
    assert_eq!(Settlement::for_failure(2, 3), Settlement::Requeue);
    assert_eq!(Settlement::for_failure(3, 3), Settlement::DeadLetter);
    assert_eq!(Settlement::for_failure(4, 3), Settlement::DeadLetter);
}

#[test]
fn dead_letter_queue_names() {
    assert_eq!(
        dead_letter_queue("grade_notifications"),
        "grade_notifications.dead"
    );
    assert_eq!(dead_letter_queue("adhoc"), "adhoc.dead");
    assert_eq!(redelivery_key("q", "abc"), "redelivery:q:abc");
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_message_is_acked_once() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::failing(0);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    assert!(broker.publish("q", &json!({"hello": "world"})).await);
    eventually(|| async { handler.calls() == 1 && broker.unacked_count("q") == 0 }).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.seen(), vec![json!({"hello": "world"})]);
    assert_eq!(depth(&broker, "q").await, 0);

    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_on_one_queue_are_handled_in_order() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::failing(0);

    for n in 0..5 {
        broker.publish("q", &json!(n)).await;
    }

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    eventually(|| async { handler.calls() == 5 }).await;
    assert_eq!(handler.seen(), (0..5).map(|n| json!(n)).collect::<Vec<_>>());

    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_message_is_redelivered_until_it_succeeds() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::failing(3);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!({"job": 1})).await;
    eventually(|| async { handler.calls() == 4 && broker.unacked_count("q") == 0 }).await;
    assert_eq!(depth(&broker, "q").await, 0);

    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_failing_message_keeps_coming_back_without_policy() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::failing(usize::MAX);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!({"job": "poison"})).await;
    eventually(|| async { handler.calls() >= 3 }).await;

    stop(&engine, handle).await;
    assert_eq!(depth(&broker, "q").await, 1);
    assert_eq!(broker.unacked_count("q"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_is_requeued_without_reaching_handler() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::failing(0);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker
        .send("q", b"{not json".to_vec(), "bad-1".to_string())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop(&engine, handle).await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(depth(&broker, "q").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queues_are_consumed_independently() {
    let broker = MemoryBroker::new();
    broker.declare_queue("slow").await.unwrap();
    broker.declare_queue("fast").await.unwrap();
    let slow = Recorder::slow(Duration::from_millis(500));
    let fast = Recorder::failing(0);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("slow", slow.clone()).register("fast", fast.clone());
    let handle = start(&engine);

    broker.publish("slow", &json!("s")).await;
    broker.publish("fast", &json!("f")).await;

    eventually(|| async { fast.calls() == 1 }).await;
    assert!(slow.seen().is_empty(), "fast queue waited on the slow handler");

    eventually(|| async { slow.seen().len() == 1 }).await;
    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_replaces_previous_handler() {
    let broker = MemoryBroker::new();
    let first = Recorder::failing(0);
    let second = Recorder::failing(0);

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", first.clone()).register("q", second.clone());
    assert_eq!(engine.queues(), vec!["q"]);

    let handle = start(&engine);
    broker.publish("q", &json!(1)).await;
    eventually(|| async { second.calls() == 1 }).await;
    assert_eq!(first.calls(), 0);

    stop(&engine, handle).await;
}

/// Panics on its first call, succeeds afterwards.
#[derive(Default)]
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler for PanicsOnce {
    async fn handle(&self, _message: Value) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("report template missing");
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_requeued_and_loop_survives() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Arc::new(PanicsOnce::default());

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!({"job": 1})).await;
    eventually(|| async {
        handler.calls.load(Ordering::SeqCst) == 2 && broker.unacked_count("q") == 0
    })
    .await;

    assert_eq!(depth(&broker, "q").await, 0);
    assert_eq!(broker.stats("q").await.unwrap().consumer_count, 1);
    assert!(!handle.is_finished());

    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_counts_toward_dead_letter_limit() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(PanicsOnce::default());

    let config = EngineConfig {
        dead_letter: Some(DeadLetterPolicy::new(1)),
        ..Default::default()
    };
    let mut engine =
        ConsumerEngine::new(Arc::new(broker.clone()), config).with_store(store.clone());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!({"job": 1})).await;
    eventually(|| async { depth(&broker, "q.dead").await == 1 }).await;

    stop(&engine, handle).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count("q"), 0);
}

// ---------------------------------------------------------------------------
// Dead-lettering
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_message_moves_to_dead_letter_queue() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = Recorder::failing(usize::MAX);

    let config = EngineConfig {
        dead_letter: Some(DeadLetterPolicy::new(3)),
        ..Default::default()
    };
    let mut engine =
        ConsumerEngine::new(Arc::new(broker.clone()), config).with_store(store.clone());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!({"job": "poison"})).await;
    eventually(|| async { depth(&broker, "q.dead").await == 1 }).await;

    stop(&engine, handle).await;
    assert_eq!(handler.calls(), 3);
    assert_eq!(depth(&broker, "q").await, 0);
    assert_eq!(broker.unacked_count("q"), 0);
    assert!(store.keys("redelivery:*").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn success_clears_attempt_counter() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = Recorder::failing(1);

    let config = EngineConfig {
        dead_letter: Some(DeadLetterPolicy::new(5)),
        ..Default::default()
    };
    let mut engine =
        ConsumerEngine::new(Arc::new(broker.clone()), config).with_store(store.clone());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!(1)).await;
    eventually(|| async { handler.calls() == 2 && broker.unacked_count("q") == 0 }).await;
    eventually(|| async { store.keys("redelivery:*").await.unwrap().is_empty() }).await;

    stop(&engine, handle).await;
    assert_eq!(depth(&broker, "q.dead").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_letter_policy_requires_store() {
    let broker = MemoryBroker::new();
    let config = EngineConfig {
        dead_letter: Some(DeadLetterPolicy::new(3)),
        ..Default::default()
    };
    let mut engine = ConsumerEngine::new(Arc::new(broker), config);
    engine.register("q", Recorder::failing(0));

    assert!(matches!(engine.run().await, Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_in_flight_message_settle() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let handler = Recorder::slow(Duration::from_millis(300));

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", handler.clone());
    let handle = start(&engine);

    broker.publish("q", &json!("in-flight")).await;
    eventually(|| async { handler.calls() == 1 }).await;

    stop(&engine, handle).await;
    assert_eq!(handler.seen(), vec![json!("in-flight")]);
    assert_eq!(depth(&broker, "q").await, 0);
    assert_eq!(broker.unacked_count("q"), 0);
    assert_eq!(broker.stats("q").await.unwrap().consumer_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_engine_stops_promptly() {
    let broker = MemoryBroker::new();
    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine
        .register("a", Recorder::failing(0))
        .register("b", Recorder::failing(0));
    let handle = start(&engine);

    eventually(|| async { broker.stats("a").await.is_ok() && broker.stats("b").await.is_ok() })
        .await;
    stop(&engine, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_disconnect_ends_loops() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q").await.unwrap();
    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    engine.register("q", Recorder::failing(0));
    let handle = start(&engine);

    eventually(|| async { broker.stats("q").await.ok().map(|s| s.consumer_count) == Some(1) }).await;
    broker.set_connected(false);

    tokio::time::timeout(WAIT, handle)
        .await
        .expect("engine did not stop after disconnect")
        .unwrap()
        .unwrap();
}
