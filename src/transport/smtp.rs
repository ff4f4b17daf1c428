//! SMTP transport via lettre.
//!
//! lettre's `SmtpTransport` is blocking, so each send runs on the blocking
//! pool. One instance exists per routing domain; the domain supplies the
//! default sender address and the Message-ID host.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, Transport as _};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::{ConfigError, TransportError};
use crate::mail::Job;
use crate::transport::Transport;

/// Fallback MIME type for attachments submitted without one.
const OCTET_STREAM: &str = "application/octet-stream";

/// Relay connection timeout. The dispatcher bounds the whole send separately.
const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct SmtpTransport {
    name: String,
    domain: String,
    mailer: lettre::SmtpTransport,
    default_from: String,
    default_from_name: Option<String>,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, domain: &str) -> Result<Self, ConfigError> {
        // Port 465 is implicit TLS; anything else upgrades with STARTTLS.
        let builder = if config.port == 465 {
            lettre::SmtpTransport::relay(&config.host)
        } else {
            lettre::SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| ConfigError::InvalidValue {
            key: "SMTP_HOST".into(),
            message: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .timeout(Some(SMTP_TIMEOUT));

        let builder = if config.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ))
        };

        Ok(Self {
            name: format!("smtp:{domain}"),
            domain: domain.to_string(),
            mailer: builder.build(),
            default_from: format!("{}@{domain}", config.default_from_local),
            default_from_name: config.default_from_name.clone(),
        })
    }

    fn invalid(&self, reason: String) -> TransportError {
        TransportError::InvalidMessage {
            name: self.name.clone(),
            reason,
        }
    }

    fn mailbox(&self, name: Option<&String>, addr: &str, field: &str) -> Result<Mailbox, TransportError> {
        let address: Address = addr
            .parse()
            .map_err(|e| self.invalid(format!("Invalid {field} address {addr:?}: {e}")))?;
        Ok(Mailbox::new(name.cloned(), address))
    }

    /// Build the MIME message for a job. Returns it with its Message-ID.
    fn build_message(&self, job: &Job) -> Result<(Message, String), TransportError> {
        let from = self.mailbox(
            job.from_name.as_ref().or(self.default_from_name.as_ref()),
            job.from_addr.as_deref().unwrap_or(&self.default_from),
            "from",
        )?;
        let to = self.mailbox(job.to_name.as_ref(), &job.to_addr, "to")?;

        // Stable per job, so a redelivery after a crash carries the same id.
        let message_id = format!("<{}@{}>", job.idem_key(), self.domain);

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(job.subject.clone())
            .message_id(Some(message_id.clone()));
        if let Some(reply_to) = &job.reply_to {
            builder = builder.reply_to(self.mailbox(None, reply_to, "reply-to")?);
        }

        let message = if job.attachments.is_empty() {
            match (&job.text_body, &job.html_body) {
                (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
                    text.clone(),
                    html.clone(),
                )),
                (None, Some(html)) => builder.singlepart(SinglePart::html(html.clone())),
                (text, None) => {
                    builder.singlepart(SinglePart::plain(text.clone().unwrap_or_default()))
                }
            }
        } else {
            let mut mixed = match (&job.text_body, &job.html_body) {
                (Some(text), Some(html)) => MultiPart::mixed().multipart(
                    MultiPart::alternative_plain_html(text.clone(), html.clone()),
                ),
                (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html.clone())),
                (text, None) => MultiPart::mixed()
                    .singlepart(SinglePart::plain(text.clone().unwrap_or_default())),
            };
            for attachment in &job.attachments {
                let mime = if attachment.mime_type.is_empty() {
                    OCTET_STREAM
                } else {
                    attachment.mime_type.as_str()
                };
                let content_type = ContentType::parse(mime).map_err(|e| {
                    self.invalid(format!(
                        "Invalid MIME type {mime:?} on {}: {e}",
                        attachment.name
                    ))
                })?;
                mixed = mixed.singlepart(
                    MimeAttachment::new(attachment.name.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }
            builder.multipart(mixed)
        }
        .map_err(|e| self.invalid(format!("Failed to build email: {e}")))?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, job: &Job) -> Result<String, TransportError> {
        let (message, message_id) = self.build_message(job)?;
        let mailer = self.mailer.clone();

        tokio::task::spawn_blocking(move || mailer.send(&message))
            .await
            .map_err(|e| TransportError::SendFailed {
                name: self.name.clone(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| TransportError::SendFailed {
                name: self.name.clone(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        info!(transport = %self.name, to = %job.to_addr, message_id = %message_id, "Email sent");
        Ok(message_id)
    }
}
