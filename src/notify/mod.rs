//! Reviewer notifications for enforced violations.
//!
//! `NotificationComposer` drafts the alert (LLM first, template fallback) and
//! fans it out to every configured `NotificationChannel`. Channels fail
//! independently; the alert counts as sent if any channel delivered it.

pub mod composer;
pub mod email;
pub mod webhook;

pub use composer::{NotificationComposer, fallback_draft, redact_excerpt, summary_for};
pub use email::{EmailChannel, EmailConfig, SmtpSecurity};
pub use webhook::WebhookChannel;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::NotifyError;
use crate::moderation::types::Severity;

/// What reviewers are told about one violation. `excerpt` is already redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationSummary {
    pub violations: Vec<String>,
    pub severity: Severity,
    pub action_taken: String,
    pub justification: String,
    pub author: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub excerpt: String,
}

/// Subject and body as drafted by the composer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationDraft {
    pub subject: String,
    pub body: String,
    pub urgency: Option<Severity>,
    pub recommended_actions: Vec<String>,
}

/// Who wrote the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposedBy {
    Llm,
    Template,
}

/// A ready-to-send notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub urgency: Severity,
    pub recommended_actions: Vec<String>,
    pub summary: ViolationSummary,
    pub composed_by: ComposedBy,
}

/// Provider acknowledgement of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub provider_id: Option<String>,
}

/// One outbound notification transport.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError>;
}

/// Result for one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDelivery {
    pub channel: String,
    pub success: bool,
    pub provider_id: Option<String>,
    pub error: Option<String>,
}

/// Result of a notify call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationOutcome {
    /// True when at least one channel delivered.
    pub sent: bool,
    pub deliveries: Vec<ChannelDelivery>,
    pub composed_by: Option<ComposedBy>,
}

impl NotificationOutcome {
    /// Outcome when the verdict did not ask for a notification.
    pub fn skipped() -> Self {
        Self {
            sent: false,
            deliveries: Vec::new(),
            composed_by: None,
        }
    }
}
