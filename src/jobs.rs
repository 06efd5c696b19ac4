//! Job handlers registered by the worker, one per registry queue.
//!
//! Payloads are camelCase JSON. A payload that does not decode into the
//! expected shape fails the handler like any other error.

use crate::engine::Handler;
use crate::error::{Error, Result};
use crate::lock::{DEFAULT_LOCK_TTL_MS, LockManager};
use crate::notify::Notifier;
use crate::registry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeNotification {
    pub student_nim: String,
    pub course_name: String,
    pub letter_grade: String,
    pub final_score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub student_nim: String,
    #[serde(rename = "type")]
    pub report_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Recipient address for a student.
pub fn student_address(nim: &str, domain: &str) -> String {
    format!("{nim}@{domain}")
}

impl GradeNotification {
    pub fn to_email(&self, domain: &str) -> EmailMessage {
        EmailMessage {
            to: student_address(&self.student_nim, domain),
            subject: format!("Nilai {} Telah Tersedia", self.course_name),
            html: format!(
                "<h2>Notifikasi Nilai</h2>\
                 <p>Halo Mahasiswa dengan NIM <strong>{nim}</strong>,</p>\
                 <p>Nilai Anda untuk mata kuliah <strong>{course}</strong> telah difinalisasi:</p>\
                 <ul>\
                 <li>Nilai Akhir: <strong>{score}</strong></li>\
                 <li>Nilai Huruf: <strong>{letter}</strong></li>\
                 </ul>\
                 <p>Terima kasih.</p>\
                 <p><em>SIAKAD System</em></p>",
                nim = self.student_nim,
                course = self.course_name,
                score = self.final_score,
                letter = self.letter_grade,
            ),
        }
    }
}

impl ReportRequest {
    pub fn to_email(&self, domain: &str) -> EmailMessage {
        EmailMessage {
            to: student_address(&self.student_nim, domain),
            subject: format!("Report {} Tersedia", self.report_type),
            html: format!(
                "<h2>Report Generated</h2>\
                 <p>Halo Mahasiswa dengan NIM <strong>{nim}</strong>,</p>\
                 <p>Report <strong>{kind}</strong> Anda telah selesai dibuat.</p>\
                 <p>Silakan cek sistem SIAKAD untuk mengunduh report.</p>\
                 <p><em>SIAKAD System</em></p>",
                nim = self.student_nim,
                kind = self.report_type,
            ),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(message: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(message)?)
}

pub struct GradeNotificationHandler {
    notifier: Arc<dyn Notifier>,
    student_domain: String,
}

impl GradeNotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>, student_domain: impl Into<String>) -> Self {
        Self {
            notifier,
            student_domain: student_domain.into(),
        }
    }
}

#[async_trait]
impl Handler for GradeNotificationHandler {
    async fn handle(&self, message: serde_json::Value) -> Result<()> {
        let grade: GradeNotification = decode(message)?;
        let email = grade.to_email(&self.student_domain);
        self.notifier
            .send(&email.to, &email.subject, &email.html)
            .await?;
        info!(nim = %grade.student_nim, course = %grade.course_name, "grade notification sent");
        Ok(())
    }
}

/// Generates a report, holding `report:<nim>` so two workers never build
/// the same student's report at once.
pub struct ReportGenerationHandler {
    notifier: Arc<dyn Notifier>,
    locks: LockManager,
    student_domain: String,
    generation_time: Duration,
}

impl ReportGenerationHandler {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        locks: LockManager,
        student_domain: impl Into<String>,
        generation_time: Duration,
    ) -> Self {
        Self {
            notifier,
            locks,
            student_domain: student_domain.into(),
            generation_time,
        }
    }

    /// Lock ttl: the generation time plus the default lock lifetime as margin.
    pub fn lock_ttl_ms(&self) -> u64 {
        let generation_ms = u64::try_from(self.generation_time.as_millis()).unwrap_or(u64::MAX);
        generation_ms.saturating_add(DEFAULT_LOCK_TTL_MS)
    }
}

#[async_trait]
impl Handler for ReportGenerationHandler {
    async fn handle(&self, message: serde_json::Value) -> Result<()> {
        let request: ReportRequest = decode(message)?;
        let lock_name = format!("report:{}", request.student_nim);

        let guard = self
            .locks
            .acquire(&lock_name, self.lock_ttl_ms())
            .await?
            .ok_or_else(|| Error::Handler(format!("{lock_name} is held by another worker")))?;

        // Stands in for report rendering, which happens outside this worker.
        tokio::time::sleep(self.generation_time).await;

        let email = request.to_email(&self.student_domain);
        let sent = self
            .notifier
            .send(&email.to, &email.subject, &email.html)
            .await;
        self.locks.release(&guard).await?;
        sent?;

        info!(nim = %request.student_nim, report = %request.report_type, "report generated");
        Ok(())
    }
}

pub struct EmailHandler {
    notifier: Arc<dyn Notifier>,
}

impl EmailHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Handler for EmailHandler {
    async fn handle(&self, message: serde_json::Value) -> Result<()> {
        let email: EmailMessage = decode(message)?;
        self.notifier
            .send(&email.to, &email.subject, &email.html)
            .await
    }
}

/// Logs whatever arrives on the log queue.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, message: serde_json::Value) -> Result<()> {
        info!(queue = registry::LOG_QUEUE, payload = %message, "log entry");
        Ok(())
    }
}

/// What the standard job handlers need from the composition root.
pub struct JobContext {
    pub notifier: Arc<dyn Notifier>,
    pub locks: LockManager,
    pub student_domain: String,
    pub report_generation_time: Duration,
}

/// Register the handler for every registry queue.
pub fn register_all(engine: &mut crate::engine::ConsumerEngine, ctx: JobContext) {
    engine
        .register(
            registry::GRADE_NOTIFICATIONS,
            Arc::new(GradeNotificationHandler::new(
                Arc::clone(&ctx.notifier),
                ctx.student_domain.clone(),
            )),
        )
        .register(
            registry::REPORT_GENERATION,
            Arc::new(ReportGenerationHandler::new(
                Arc::clone(&ctx.notifier),
                ctx.locks.clone(),
                ctx.student_domain.clone(),
                ctx.report_generation_time,
            )),
        )
        .register(
            registry::EMAIL_QUEUE,
            Arc::new(EmailHandler::new(Arc::clone(&ctx.notifier))),
        )
        .register(registry::LOG_QUEUE, Arc::new(LogHandler));
}
