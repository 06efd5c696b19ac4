//! Job handlers end to end: publish, consume, notify.

use async_trait::async_trait;
use serde_json::json;
use siakad_queue::broker::{Broker, MemoryBroker};
use siakad_queue::engine::{ConsumerEngine, EngineConfig, Handler};
use siakad_queue::error::{Error, Result};
use siakad_queue::jobs::{
    self, GradeNotification, JobContext, ReportGenerationHandler, ReportRequest,
};
use siakad_queue::lock::LockManager;
use siakad_queue::notify::Notifier;
use siakad_queue::registry;
use siakad_queue::store::MemoryStore;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct Sent {
    to: String,
    subject: String,
    html: String,
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    fail: bool,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        if self.fail {
            return Err(Error::Mail("relay rejected message".to_string()));
        }
        self.sent.lock().unwrap().push(Sent {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

async fn wait_for(notifier: &RecordingNotifier, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while notifier.sent().len() < count {
        assert!(tokio::time::Instant::now() < deadline, "notification not sent in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn grade_email_addresses_student_and_names_course() {
    let grade = GradeNotification {
        student_nim: "123".to_string(),
        course_name: "CS101".to_string(),
        letter_grade: "A".to_string(),
        final_score: 95.0,
    };

    let email = grade.to_email("student.ac.id");
    assert_eq!(email.to, "123@student.ac.id");
    assert_eq!(email.subject, "Nilai CS101 Telah Tersedia");
    assert!(email.html.contains("<strong>95</strong>"));
    assert!(email.html.contains("<strong>A</strong>"));
}

#[test]
fn grade_payload_is_camel_case() {
    let grade: GradeNotification = serde_json::from_value(json!({
        "studentNim": "123",
        "courseName": "CS101",
        "letterGrade": "A",
        "finalScore": 95
    }))
    .unwrap();
    assert_eq!(grade.student_nim, "123");
    assert_eq!(grade.final_score, 95.0);

    let report: ReportRequest =
        serde_json::from_value(json!({"studentNim": "123", "type": "transcript"})).unwrap();
    assert_eq!(report.report_type, "transcript");
    assert_eq!(report.to_email("x.id").subject, "Report transcript Tersedia");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grade_notification_sends_one_email() {
    let broker = MemoryBroker::new();
    broker.declare_all().await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    jobs::register_all(
        &mut engine,
        JobContext {
            notifier: notifier.clone(),
            locks: LockManager::new(store),
            student_domain: "student.ac.id".to_string(),
            report_generation_time: Duration::ZERO,
        },
    );
    let ctrl = engine.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    let message = json!({
        "studentNim": "123",
        "courseName": "CS101",
        "letterGrade": "A",
        "finalScore": 95
    });
    assert!(broker.publish(registry::GRADE_NOTIFICATIONS, &message).await);

    wait_for(&notifier, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "123@student.ac.id");
    assert!(sent[0].subject.contains("CS101"));

    engine.shutdown();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    assert_eq!(broker.purge(registry::GRADE_NOTIFICATIONS).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn email_queue_forwards_fields_verbatim() {
    let broker = MemoryBroker::new();
    broker.declare_all().await.unwrap();
    let notifier = Arc::new(RecordingNotifier::default());

    let mut engine = ConsumerEngine::new(Arc::new(broker.clone()), EngineConfig::default());
    jobs::register_all(
        &mut engine,
        JobContext {
            notifier: notifier.clone(),
            locks: LockManager::new(Arc::new(MemoryStore::new())),
            student_domain: "student.ac.id".to_string(),
            report_generation_time: Duration::ZERO,
        },
    );
    let ctrl = engine.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    broker
        .publish(
            registry::EMAIL_QUEUE,
            &json!({"to": "dosen@siakad.ac.id", "subject": "Rapat", "html": "<p>Besok</p>"}),
        )
        .await;
    wait_for(&notifier, 1).await;

    assert_eq!(
        notifier.sent()[0],
        Sent {
            to: "dosen@siakad.ac.id".to_string(),
            subject: "Rapat".to_string(),
            html: "<p>Besok</p>".to_string(),
        }
    );

    engine.shutdown();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn report_handler_releases_its_lock() {
    let store = Arc::new(MemoryStore::new());
    let locks = LockManager::new(store);
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = ReportGenerationHandler::new(
        notifier.clone(),
        locks.clone(),
        "student.ac.id",
        Duration::from_millis(10),
    );

    handler
        .handle(json!({"studentNim": "123", "type": "transcript"}))
        .await
        .unwrap();

    assert!(!locks.is_locked("report:123").await.unwrap());
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Report transcript Tersedia");
}

#[tokio::test(start_paused = true)]
async fn report_lock_outlives_long_generation() {
    let locks = LockManager::new(Arc::new(MemoryStore::new()));
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = Arc::new(ReportGenerationHandler::new(
        notifier.clone(),
        locks.clone(),
        "student.ac.id",
        Duration::from_secs(15),
    ));
    assert!(handler.lock_ttl_ms() > 15_000);

    let worker = Arc::clone(&handler);
    let job = tokio::spawn(async move {
        worker
            .handle(json!({"studentNim": "123", "type": "transcript"}))
            .await
    });

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(locks.is_locked("report:123").await.unwrap());

    job.await.unwrap().unwrap();
    assert!(!locks.is_locked("report:123").await.unwrap());
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn report_handler_fails_while_another_worker_holds_the_lock() {
    let locks = LockManager::new(Arc::new(MemoryStore::new()));
    let notifier = Arc::new(RecordingNotifier::default());
    let handler =
        ReportGenerationHandler::new(notifier.clone(), locks.clone(), "student.ac.id", Duration::ZERO);

    let held = locks.acquire("report:123", 10_000).await.unwrap().unwrap();
    let result = handler
        .handle(json!({"studentNim": "123", "type": "transcript"}))
        .await;

    assert!(matches!(result, Err(Error::Handler(_))));
    assert!(notifier.sent().is_empty());
    assert!(locks.release(&held).await.unwrap());
}

#[tokio::test]
async fn report_handler_releases_lock_when_notifier_fails() {
    let locks = LockManager::new(Arc::new(MemoryStore::new()));
    let notifier = Arc::new(RecordingNotifier {
        fail: true,
        ..Default::default()
    });
    let handler = ReportGenerationHandler::new(notifier, locks.clone(), "student.ac.id", Duration::ZERO);

    let result = handler
        .handle(json!({"studentNim": "123", "type": "transcript"}))
        .await;

    assert!(matches!(result, Err(Error::Mail(_))));
    assert!(!locks.is_locked("report:123").await.unwrap());
}

#[tokio::test]
async fn malformed_grade_payload_fails_handler() {
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = jobs::GradeNotificationHandler::new(notifier.clone(), "student.ac.id");

    let result = handler.handle(json!({"studentNim": "123"})).await;
    assert!(matches!(result, Err(Error::Payload(_))));
    assert!(notifier.sent().is_empty());
}
