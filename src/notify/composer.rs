//! Notification drafting and fan-out.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::NotifyError;
use crate::moderation::judge::ContextualJudge;
use crate::moderation::types::{InboundMessage, Severity, Verdict};
use crate::notify::{
    ChannelDelivery, ComposedBy, Notification, NotificationChannel, NotificationDraft,
    NotificationOutcome, ViolationSummary,
};
use crate::pipeline::actions::ActionOutcome;
use crate::text::truncate_chars;

/// Longest excerpt quoted in a notification.
const MAX_EXCERPT_CHARS: usize = 100;

const REDACTED: &str = "[Content redacted due to severe violation]";
const TRUNCATED: &str = "... [truncated]";

/// Excerpt safe to show reviewers: nothing for high severity, at most
/// 100 characters otherwise.
pub fn redact_excerpt(content: &str, severity: Severity) -> String {
    if severity == Severity::High {
        return REDACTED.to_string();
    }
    truncate_chars(content, MAX_EXCERPT_CHARS, TRUNCATED)
}

/// Template used when the LLM draft is unavailable.
pub fn fallback_draft(summary: &ViolationSummary) -> NotificationDraft {
    NotificationDraft {
        subject: format!(
            "Content Policy Violation Detected - {}",
            summary.severity.as_str().to_uppercase()
        ),
        body: format!(
            "A policy violation was detected.\n\n\
             Violations: {}\n\
             Action: {}\n\
             Author: {}\n\
             Channel: {}\n\
             Excerpt: \"{}\"\n\n\
             Please review the moderation logs for details.",
            summary.violations.join(", "),
            summary.action_taken,
            summary.author,
            summary.channel,
            summary.excerpt,
        ),
        urgency: Some(summary.severity),
        recommended_actions: vec![
            "Review incident".to_string(),
            "Contact user if needed".to_string(),
        ],
    }
}

/// Drafts and delivers reviewer notifications.
pub struct NotificationComposer {
    writer: Option<Arc<dyn ContextualJudge>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
}

impl NotificationComposer {
    pub fn new(
        writer: Option<Arc<dyn ContextualJudge>>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        timeout: Duration,
    ) -> Self {
        Self {
            writer,
            channels,
            timeout,
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Notify reviewers about `message` if the verdict asks for it.
    ///
    /// Never fails: composition falls back to a template and each channel's
    /// error is recorded in the outcome.
    pub async fn notify(
        &self,
        message: &InboundMessage,
        verdict: &Verdict,
        action: &ActionOutcome,
    ) -> NotificationOutcome {
        if !verdict.notify {
            return NotificationOutcome::skipped();
        }

        let summary = summary_for(message, verdict, action.action_taken.as_str());

        let (draft, composed_by) = self.compose(&summary).await;
        let notification = Notification {
            message_id: message.id.clone(),
            urgency: draft.urgency.unwrap_or(verdict.severity),
            subject: draft.subject,
            body: draft.body,
            recommended_actions: draft.recommended_actions,
            summary,
            composed_by,
        };

        let deliveries = self.dispatch(&notification).await;
        let sent = deliveries.iter().any(|d| d.success);

        if sent {
            info!(
                message_id = %message.id,
                delivered = deliveries.iter().filter(|d| d.success).count(),
                attempted = deliveries.len(),
                "Notification sent"
            );
        } else {
            warn!(
                message_id = %message.id,
                attempted = deliveries.len(),
                "Notification not delivered on any channel"
            );
        }

        NotificationOutcome {
            sent,
            deliveries,
            composed_by: Some(composed_by),
        }
    }

    async fn compose(&self, summary: &ViolationSummary) -> (NotificationDraft, ComposedBy) {
        let Some(writer) = &self.writer else {
            return (fallback_draft(summary), ComposedBy::Template);
        };

        match tokio::time::timeout(self.timeout, writer.compose_notification(summary)).await {
            Ok(Ok(draft)) => (draft, ComposedBy::Llm),
            Ok(Err(e)) => {
                warn!(error = %e, "Notification drafting failed, using template");
                (fallback_draft(summary), ComposedBy::Template)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Notification drafting timed out, using template"
                );
                (fallback_draft(summary), ComposedBy::Template)
            }
        }
    }

    /// Send on every channel concurrently; results keep channel order.
    async fn dispatch(&self, notification: &Notification) -> Vec<ChannelDelivery> {
        let sends = self.channels.iter().map(|channel| async move {
            let name = channel.name().to_string();
            let result = match tokio::time::timeout(self.timeout, channel.send(notification)).await
            {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout {
                    channel: name.clone(),
                    timeout: self.timeout,
                }),
            };

            match result {
                Ok(receipt) => ChannelDelivery {
                    channel: name,
                    success: true,
                    provider_id: receipt.provider_id,
                    error: None,
                },
                Err(e) => {
                    warn!(channel = %name, error = %e, "Notification channel failed");
                    ChannelDelivery {
                        channel: name,
                        success: false,
                        provider_id: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        });

        join_all(sends).await
    }
}

/// Reviewer-facing facts about one enforced message.
pub fn summary_for(
    message: &InboundMessage,
    verdict: &Verdict,
    action_taken: &str,
) -> ViolationSummary {
    ViolationSummary {
        violations: verdict.violated_categories.clone(),
        severity: verdict.severity,
        action_taken: action_taken.to_string(),
        justification: verdict.justification.clone(),
        author: message.author_display_name.clone(),
        channel: message.channel_label().to_string(),
        timestamp: message.created_at,
        excerpt: redact_excerpt(&message.content, verdict.severity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::LlmError;
    use crate::moderation::judge::JudgeContext;
    use crate::moderation::types::{BaselineScore, Judgment, PolicyAction};
    use crate::notify::DeliveryReceipt;
    use crate::pipeline::actions::ActionTaken;

    struct RecordingChannel {
        name: &'static str,
        fail: bool,
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingChannel {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                Err(NotifyError::Status {
                    channel: self.name.to_string(),
                    status: 500,
                })
            } else {
                Ok(DeliveryReceipt {
                    provider_id: Some(format!("{}-1", self.name)),
                })
            }
        }
    }

    struct HangingChannel;

    #[async_trait]
    impl NotificationChannel for HangingChannel {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(&self, _notification: &Notification) -> Result<DeliveryReceipt, NotifyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(DeliveryReceipt::default())
        }
    }

    /// Writer that drafts or fails on demand and counts calls.
    struct MockWriter {
        draft: Option<NotificationDraft>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContextualJudge for MockWriter {
        async fn judge(
            &self,
            _text: &str,
            _context: &JudgeContext,
            _baseline: &BaselineScore,
        ) -> Result<Judgment, LlmError> {
            unimplemented!("not used by the composer")
        }

        async fn compose_notification(
            &self,
            _summary: &ViolationSummary,
        ) -> Result<NotificationDraft, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.draft.clone().ok_or(LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "down".into(),
            })
        }
    }

    fn message(content: &str) -> InboundMessage {
        InboundMessage {
            id: "m-1".into(),
            channel_id: "19:general".into(),
            channel_name: Some("General".into()),
            author_id: "u-1".into(),
            author_display_name: "Dana".into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    fn verdict(severity: Severity, notify: bool) -> Verdict {
        Verdict {
            is_violation: true,
            violated_categories: vec!["hate_speech".into()],
            severity,
            confidence: 0.9,
            action: PolicyAction::Delete,
            notify,
            justification: "slur".into(),
            recommended_action: Some(PolicyAction::Delete),
            baseline: BaselineScore::default(),
        }
    }

    fn deleted() -> ActionOutcome {
        ActionOutcome {
            action_taken: ActionTaken::Deleted,
            error: None,
        }
    }

    #[test]
    fn high_severity_is_fully_redacted() {
        assert_eq!(redact_excerpt("awful words", Severity::High), REDACTED);
    }

    #[test]
    fn long_content_is_truncated() {
        let long = "a".repeat(150);
        let excerpt = redact_excerpt(&long, Severity::Medium);
        assert_eq!(excerpt, format!("{}{}", "a".repeat(100), TRUNCATED));
        assert_eq!(redact_excerpt("short", Severity::Low), "short");
    }

    #[test]
    fn fallback_template_matches_expected_shape() {
        let summary = summary_for(&message("hi"), &verdict(Severity::Medium, true), "flagged");
        let draft = fallback_draft(&summary);
        assert_eq!(draft.subject, "Content Policy Violation Detected - MEDIUM");
        assert!(draft.body.contains("Violations: hate_speech"));
        assert!(draft.body.contains("Action: flagged"));
        assert!(draft.body.contains("Please review the moderation logs"));
        assert_eq!(
            draft.recommended_actions,
            vec!["Review incident", "Contact user if needed"]
        );
    }

    #[tokio::test]
    async fn no_notification_when_verdict_says_no() {
        let channel = RecordingChannel::new("webhook", false);
        let composer =
            NotificationComposer::new(None, vec![channel.clone()], Duration::from_secs(1));

        let outcome = composer
            .notify(&message("x"), &verdict(Severity::Low, false), &deleted())
            .await;
        assert!(!outcome.sent);
        assert!(outcome.deliveries.is_empty());
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_block_others() {
        let webhook = RecordingChannel::new("webhook", true);
        let email = RecordingChannel::new("email", false);
        let composer = NotificationComposer::new(
            None,
            vec![webhook.clone(), email.clone()],
            Duration::from_secs(1),
        );

        let outcome = composer
            .notify(&message("x"), &verdict(Severity::Medium, true), &deleted())
            .await;
        assert!(outcome.sent);
        assert_eq!(outcome.deliveries.len(), 2);
        assert_eq!(outcome.deliveries[0].channel, "webhook");
        assert!(!outcome.deliveries[0].success);
        assert!(outcome.deliveries[0].error.is_some());
        assert!(outcome.deliveries[1].success);
        assert_eq!(outcome.deliveries[1].provider_id.as_deref(), Some("email-1"));
        assert_eq!(email.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_channels_failing_reports_not_sent() {
        let composer = NotificationComposer::new(
            None,
            vec![RecordingChannel::new("webhook", true)],
            Duration::from_secs(1),
        );
        let outcome = composer
            .notify(&message("x"), &verdict(Severity::Medium, true), &deleted())
            .await;
        assert!(!outcome.sent);
    }

    #[tokio::test]
    async fn slow_channel_times_out() {
        let email = RecordingChannel::new("email", false);
        let composer = NotificationComposer::new(
            None,
            vec![Arc::new(HangingChannel), email.clone()],
            Duration::from_millis(50),
        );
        let outcome = composer
            .notify(&message("x"), &verdict(Severity::Low, true), &deleted())
            .await;
        assert!(outcome.sent);
        assert!(!outcome.deliveries[0].success);
        assert!(outcome.deliveries[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn llm_draft_is_used_when_available() {
        let writer = Arc::new(MockWriter {
            draft: Some(NotificationDraft {
                subject: "Urgent: hate speech in General".into(),
                body: "Details".into(),
                urgency: Some(Severity::High),
                recommended_actions: vec!["Escalate".into()],
            }),
            calls: AtomicUsize::new(0),
        });
        let channel = RecordingChannel::new("webhook", false);
        let composer = NotificationComposer::new(
            Some(writer.clone()),
            vec![channel.clone()],
            Duration::from_secs(1),
        );

        let outcome = composer
            .notify(&message("x"), &verdict(Severity::High, true), &deleted())
            .await;
        assert_eq!(outcome.composed_by, Some(ComposedBy::Llm));
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Urgent: hate speech in General");
        assert_eq!(sent[0].summary.excerpt, REDACTED);
        assert_eq!(sent[0].summary.action_taken, "deleted");
    }

    #[tokio::test]
    async fn drafting_failure_falls_back_to_template() {
        let writer = Arc::new(MockWriter {
            draft: None,
            calls: AtomicUsize::new(0),
        });
        let channel = RecordingChannel::new("webhook", false);
        let composer = NotificationComposer::new(
            Some(writer.clone()),
            vec![channel.clone()],
            Duration::from_secs(1),
        );

        let outcome = composer
            .notify(&message("x"), &verdict(Severity::High, true), &deleted())
            .await;
        assert!(outcome.sent);
        assert_eq!(outcome.composed_by, Some(ComposedBy::Template));
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            channel.sent.lock().unwrap()[0].subject,
            "Content Policy Violation Detected - HIGH"
        );
    }
}
