//! Outbound email notifier.

pub mod smtp;

pub use smtp::SmtpNotifier;

use crate::config::MailConfig;
use crate::error::Result;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::info;

/// Sends one HTML email. An `Err` means the message was not handed off.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

/// Notifier for environments without an SMTP relay; logs instead of sending.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        info!(to, subject, body_len = html.len(), "email (log only)");
        Ok(())
    }
}

/// Build the notifier the mail config asks for: SMTP when a host is set,
/// otherwise log-only.
pub fn from_config(config: &MailConfig) -> Result<Arc<dyn Notifier>> {
    match config.host {
        Some(_) => Ok(Arc::new(SmtpNotifier::new(config)?)),
        None => {
            info!("SMTP_HOST not set, emails will only be logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

pub(crate) fn record_send(ok: bool) {
    metrics::notifications_sent().add(
        1,
        &[KeyValue::new("result", if ok { "ok" } else { "error" })],
    );
}
