//! Incoming-webhook channel posting a Teams adaptive card.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::NotifyError;
use crate::moderation::types::Severity;
use crate::notify::{DeliveryReceipt, Notification, NotificationChannel};

const CHANNEL: &str = "webhook";

/// Posts notifications to a webhook URL as an adaptive card message.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Misconfigured {
                channel: CHANNEL.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn urgency_style(urgency: Severity) -> (&'static str, &'static str) {
    match urgency {
        Severity::High => ("attention", "🔴"),
        Severity::Medium => ("warning", "🟡"),
        Severity::Low => ("good", "🟢"),
    }
}

/// Build the adaptive card message body.
pub fn build_card(notification: &Notification) -> Value {
    let (color, marker) = urgency_style(notification.urgency);
    let summary = &notification.summary;

    let mut body = vec![
        json!({
            "type": "TextBlock",
            "text": format!("{marker} {}", notification.subject),
            "weight": "bolder",
            "size": "large",
            "color": color,
            "wrap": true,
        }),
        json!({
            "type": "FactSet",
            "facts": [
                {"title": "Severity:", "value": summary.severity.as_str().to_uppercase()},
                {"title": "Violations:", "value": summary.violations.join(", ")},
                {"title": "Author:", "value": summary.author},
                {"title": "Channel:", "value": summary.channel},
                {"title": "Action Taken:", "value": summary.action_taken},
            ],
        }),
        json!({
            "type": "TextBlock",
            "text": notification.body,
            "wrap": true,
        }),
    ];

    if !notification.recommended_actions.is_empty() {
        let actions: Vec<String> = notification
            .recommended_actions
            .iter()
            .map(|a| format!("- {a}"))
            .collect();
        body.push(json!({
            "type": "TextBlock",
            "text": format!("Recommended actions:\n{}", actions.join("\n")),
            "wrap": true,
            "isSubtle": true,
        }));
    }

    json!({
        "type": "message",
        "attachments": [{
            "contentType": "application/vnd.microsoft.card.adaptive",
            "content": {
                "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
                "type": "AdaptiveCard",
                "version": "1.4",
                "body": body,
            },
        }],
    })
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError> {
        let card = build_card(notification);
        let response = self
            .client
            .post(&self.url)
            .json(&card)
            .send()
            .await
            .map_err(|e| NotifyError::DeliveryFailed {
                channel: CHANNEL.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                channel: CHANNEL.to_string(),
                status: status.as_u16(),
            });
        }

        let provider_id = response
            .headers()
            .get("request-id")
            .or_else(|| response.headers().get("x-request-id"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(status = status.as_u16(), "Webhook notification accepted");

        Ok(DeliveryReceipt { provider_id })
    }
}
