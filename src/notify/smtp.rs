//! SMTP notifier via lettre.

use super::{Notifier, record_send};
use crate::config::MailConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::{error, info};

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    /// Build the transport. `secure` selects implicit TLS; otherwise the
    /// connection is plain, as with a local relay.
    pub fn new(config: &MailConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| Error::Config("SMTP_HOST is not set".to_string()))?;

        let mut builder = if config.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| Error::Mail(format!("invalid SMTP relay {host}: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder.port(config.port);

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                password.expose_secret().to_string(),
            ));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| Error::Config(format!("invalid EMAIL_FROM {:?}: {e}", config.from)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let recipient = to
            .parse::<Mailbox>()
            .map_err(|e| Error::Mail(format!("invalid recipient {to:?}: {e}")))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| Error::Mail(format!("failed to build email: {e}")))?;

        match self.transport.send(message).await {
            Ok(_) => {
                record_send(true);
                info!(to, subject, "email sent");
                Ok(())
            }
            Err(e) => {
                record_send(false);
                error!(to, subject, "error sending email: {e}");
                Err(Error::Mail(e.to_string()))
            }
        }
    }
}
