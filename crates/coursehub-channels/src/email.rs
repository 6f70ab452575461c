//! SMTP email transport (async lettre, STARTTLS).

use async_trait::async_trait;
use coursehub_core::config::EmailConfig;
use coursehub_core::{CourseHubError, EmailSender, Result};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Sends plain-text notifications through an SMTP relay.
pub struct SmtpEmailSender {
    from: Mailbox,
    domain: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpEmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let sender = config.sender();
        if sender.is_empty() {
            return Err(CourseHubError::Config(
                "email.from_address or email.username must be set".into(),
            ));
        }
        let from: Mailbox = format!("{} <{sender}>", config.display_name)
            .parse()
            .map_err(|e| CourseHubError::Config(format!("Invalid from: {e}")))?;
        let domain = sender.rsplit('@').next().unwrap_or("localhost").to_string();

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| CourseHubError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
        }

        Ok(Self {
            from,
            domain,
            transport: builder.build(),
        })
    }

    /// Build the message and its Message-ID.
    pub fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<(Message, String)> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| CourseHubError::TransientDelivery(format!("Invalid to '{to}': {e}")))?;
        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), self.domain);
        let email = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| CourseHubError::TransientDelivery(format!("Build email: {e}")))?;
        Ok((email, message_id))
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String> {
        let (email, message_id) = self.build_message(to, subject, body)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| CourseHubError::TransientDelivery(format!("SMTP send: {e}")))?;
        tracing::info!("📤 Email sent to: {to}");
        Ok(message_id)
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
