//! Email channel: SMTP via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::notify::{DeliveryReceipt, Notification, NotificationChannel};

const CHANNEL: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Implicit TLS, usually port 465.
    Tls,
    /// STARTTLS upgrade, usually port 587.
    StartTls,
    /// Plain connection, for local relays only.
    None,
}

impl std::str::FromStr for SmtpSecurity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            "none" | "plain" => Ok(Self::None),
            other => Err(format!("unknown SMTP security mode '{other}'")),
        }
    }
}

/// Email channel configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub security: SmtpSecurity,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub recipients: Vec<String>,
    pub timeout: Duration,
}

impl EmailConfig {
    /// Build from the process environment. Returns `None` unless both a
    /// recipient (`NOTIFICATION_EMAIL`) and `SMTP_HOST` are set.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), timeout)
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>, timeout: Duration) -> Option<Self> {
        let recipients: Vec<String> = get("NOTIFICATION_EMAIL")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if recipients.is_empty() {
            return None;
        }
        let smtp_host = get("SMTP_HOST").filter(|h| !h.trim().is_empty())?;

        let smtp_port: u16 = get("SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let security = get("SMTP_SECURITY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if smtp_port == 465 {
                SmtpSecurity::Tls
            } else {
                SmtpSecurity::StartTls
            });

        let username = get("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(get("SMTP_PASSWORD").unwrap_or_default());
        let from_address = get("EMAIL_SENDER").unwrap_or_else(|| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            security,
            username,
            password,
            from_address,
            recipients,
            timeout,
        })
    }
}

// ── Channel ─────────────────────────────────────────────────────────

/// Sends notifications as HTML email.
pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn transport(config: &EmailConfig) -> Result<SmtpTransport, NotifyError> {
        let builder = match config.security {
            SmtpSecurity::Tls => SmtpTransport::relay(&config.smtp_host),
            SmtpSecurity::StartTls => SmtpTransport::starttls_relay(&config.smtp_host),
            SmtpSecurity::None => Ok(SmtpTransport::builder_dangerous(&config.smtp_host)),
        }
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.timeout));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }
        Ok(builder.build())
    }

    /// Build the message. Returns it with the generated Message-ID.
    fn build_message(
        config: &EmailConfig,
        notification: &Notification,
    ) -> Result<(Message, String), NotifyError> {
        let domain = config
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d.trim_end_matches('>'))
            .unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let mut builder = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
            )
            .subject(notification.subject.clone())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML);

        for recipient in &config.recipients {
            builder = builder.to(recipient
                .parse()
                .map_err(|e| send_failed(format!("Invalid to address {recipient}: {e}")))?);
        }

        let email = builder
            .body(render_html(notification))
            .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;
        Ok((email, message_id))
    }
}

fn send_failed(reason: String) -> NotifyError {
    NotifyError::DeliveryFailed {
        channel: CHANNEL.to_string(),
        reason,
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// HTML rendering of a notification.
pub fn render_html(notification: &Notification) -> String {
    let summary = &notification.summary;
    let body = escape_html(&notification.body).replace('\n', "<br>\n");
    let actions: String = notification
        .recommended_actions
        .iter()
        .map(|a| format!("<li>{}</li>", escape_html(a)))
        .collect();

    format!(
        "<html><body>\
         <h2>{subject}</h2>\
         <table>\
         <tr><td><b>Severity</b></td><td>{severity}</td></tr>\
         <tr><td><b>Violations</b></td><td>{violations}</td></tr>\
         <tr><td><b>Author</b></td><td>{author}</td></tr>\
         <tr><td><b>Channel</b></td><td>{channel}</td></tr>\
         <tr><td><b>Action Taken</b></td><td>{action}</td></tr>\
         <tr><td><b>Time</b></td><td>{time}</td></tr>\
         </table>\
         <p>{body}</p>\
         <h3>Recommended actions</h3><ul>{actions}</ul>\
         </body></html>",
        subject = escape_html(&notification.subject),
        severity = summary.severity.as_str().to_uppercase(),
        violations = escape_html(&summary.violations.join(", ")),
        author = escape_html(&summary.author),
        channel = escape_html(&summary.channel),
        action = escape_html(&summary.action_taken),
        time = summary.timestamp.to_rfc3339(),
    )
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError> {
        if self.config.recipients.is_empty() {
            return Err(NotifyError::Misconfigured {
                channel: CHANNEL.to_string(),
                reason: "no recipients".to_string(),
            });
        }

        let (email, message_id) = Self::build_message(&self.config, notification)?;
        let config = self.config.clone();

        // lettre's SMTP transport is blocking.
        tokio::task::spawn_blocking(move || {
            let transport = Self::transport(&config)?;
            transport
                .send(&email)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task failed: {e}")))??;

        info!(
            recipients = self.config.recipients.len(),
            message_id = %message_id,
            "Email notification sent"
        );
        Ok(DeliveryReceipt {
            provider_id: Some(message_id),
        })
    }
}
