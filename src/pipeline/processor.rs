//! Moderation pipeline: drives one message from intake to notification.
//!
//! Flow:
//! 1. Dedup claim, channel filter, empty-content check (no external calls)
//! 2. Baseline classifier, then contextual judge (retried when transient)
//! 3. Decision against the current policy snapshot
//! 4. Action (delete is attempted once, never retried)
//! 5. Notification, when the verdict asks for one
//!
//! Every message that is not a duplicate ends with exactly one
//! `Message processed` log line carrying its outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{ClassifierError, LlmError, PipelineError};
use crate::moderation::baseline::BaselineClassifier;
use crate::moderation::decision::DecisionEngine;
use crate::moderation::judge::{ContextualJudge, JudgeContext};
use crate::moderation::types::{BaselineScore, InboundMessage, Judgment, PolicyAction, Verdict};
use crate::notify::NotificationComposer;
use crate::pipeline::actions::{ActionExecutor, ActionOutcome};
use crate::pipeline::ledger::{Outcome, ProcessedLedger};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::{MessageStage, ProcessedMessage, ShortCircuit, StageTracker};
use crate::policy::store::PolicyStore;

/// Knobs for the per-message pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Report deletes as `would_delete` instead of calling the platform.
    pub dry_run: bool,
    pub retry: RetryPolicy,
    /// Upper bound for each classifier or judge call.
    pub call_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dry_run: true,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// The moderation pipeline. Shared by all ingestion workers.
pub struct ModerationPipeline {
    store: Arc<PolicyStore>,
    classifier: Arc<dyn BaselineClassifier>,
    judge: Arc<dyn ContextualJudge>,
    engine: DecisionEngine,
    executor: ActionExecutor,
    composer: NotificationComposer,
    ledger: Arc<ProcessedLedger>,
    settings: PipelineSettings,
}

impl ModerationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PolicyStore>,
        classifier: Arc<dyn BaselineClassifier>,
        judge: Arc<dyn ContextualJudge>,
        executor: ActionExecutor,
        composer: NotificationComposer,
        ledger: Arc<ProcessedLedger>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            engine: DecisionEngine::new(store.clone()),
            store,
            classifier,
            judge,
            executor,
            composer,
            ledger,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<ProcessedLedger> {
        &self.ledger
    }

    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    /// Process one message end to end.
    ///
    /// Errors mean classification or judging failed after retries; the
    /// message is recorded as `failed` and the caller decides whether to
    /// dead-letter it.
    pub async fn process(
        &self,
        message: InboundMessage,
    ) -> Result<ProcessedMessage, PipelineError> {
        let key = message.dedup_key();
        let mut tracker = StageTracker::new(&key);

        if !self.ledger.try_claim(&key) {
            debug!(
                message_id = %message.id,
                channel_id = %message.channel_id,
                "Duplicate message skipped"
            );
            tracker.advance(MessageStage::Done);
            return Ok(finished(
                &message,
                &tracker,
                None,
                Some(ShortCircuit::Duplicate),
            ));
        }

        let snapshot = self.store.current_snapshot();
        if !snapshot
            .channels
            .is_monitored(&message.channel_id, message.channel_name.as_deref())
        {
            tracker.advance(MessageStage::Done);
            return Ok(self.short_circuit(
                &message,
                &tracker,
                Outcome::Skipped,
                ShortCircuit::ChannelNotMonitored,
            ));
        }

        if message.content.trim().is_empty() {
            tracker.advance(MessageStage::Done);
            return Ok(self.short_circuit(
                &message,
                &tracker,
                Outcome::Allowed,
                ShortCircuit::EmptyContent,
            ));
        }

        tracker.advance(MessageStage::Classifying);
        let (baseline, judgment) = match self.classify(&message).await {
            Ok(signals) => signals,
            Err(e) => {
                tracker.advance(MessageStage::Failed);
                self.ledger.record(&key, Outcome::Failed);
                error!(
                    message_id = %message.id,
                    channel_id = %message.channel_id,
                    transient = e.is_transient(),
                    error = %e,
                    "Message processing failed"
                );
                log_processed(&message, Outcome::Failed, None);
                return Err(e);
            }
        };

        tracker.advance(MessageStage::Deciding);
        let verdict = self.engine.evaluate(&baseline, &judgment);
        if verdict.is_violation && verdict.action == PolicyAction::Allow {
            warn!(
                message_id = %message.id,
                categories = ?verdict.violated_categories,
                policy_version = snapshot.version,
                "Violation without matching enabled policy rule"
            );
        }

        tracker.advance(MessageStage::Acting);
        let action = self
            .executor
            .execute(&message, &verdict, self.settings.dry_run)
            .await;
        let mut outcome = Outcome::from(action.action_taken);
        self.ledger.record(&key, outcome);

        let notification = if verdict.notify {
            tracker.advance(MessageStage::Notifying);
            let sent = self.composer.notify(&message, &verdict, &action).await;
            outcome = if sent.sent {
                Outcome::NotifySent
            } else {
                Outcome::NotifyFailed
            };
            self.ledger.record(&key, outcome);
            Some(sent)
        } else {
            None
        };

        tracker.advance(MessageStage::Done);
        log_processed(&message, outcome, Some((&verdict, &action)));

        Ok(ProcessedMessage {
            verdict: Some(verdict),
            action: Some(action),
            notification,
            ..finished(&message, &tracker, Some(outcome), None)
        })
    }

    fn short_circuit(
        &self,
        message: &InboundMessage,
        tracker: &StageTracker,
        outcome: Outcome,
        reason: ShortCircuit,
    ) -> ProcessedMessage {
        self.ledger.record(&message.dedup_key(), outcome);
        log_processed(message, outcome, None);
        finished(message, tracker, Some(outcome), Some(reason))
    }

    /// Baseline first, then the judge with the baseline as context.
    async fn classify(
        &self,
        message: &InboundMessage,
    ) -> Result<(BaselineScore, Judgment), PipelineError> {
        let timeout = self.settings.call_timeout;

        let baseline = self
            .settings
            .retry
            .run("baseline_classifier", || async {
                tokio::time::timeout(timeout, self.classifier.analyze(&message.content))
                    .await
                    .unwrap_or(Err(ClassifierError::Timeout(timeout)))
            })
            .await?;

        let context = JudgeContext {
            author: message.author_display_name.clone(),
            channel: message.channel_label().to_string(),
        };
        let judgment = self
            .settings
            .retry
            .run("contextual_judge", || async {
                tokio::time::timeout(
                    timeout,
                    self.judge.judge(&message.content, &context, &baseline),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(LlmError::Timeout {
                        provider: "judge".to_string(),
                        timeout,
                    })
                })
            })
            .await?;

        Ok((baseline, judgment))
    }
}

fn finished(
    message: &InboundMessage,
    tracker: &StageTracker,
    outcome: Option<Outcome>,
    short_circuit: Option<ShortCircuit>,
) -> ProcessedMessage {
    ProcessedMessage {
        message_id: message.id.clone(),
        channel_id: message.channel_id.clone(),
        stage: tracker.stage(),
        outcome,
        short_circuit,
        verdict: None,
        action: None,
        notification: None,
        processed_at: Utc::now(),
    }
}

fn log_processed(
    message: &InboundMessage,
    outcome: Outcome,
    decision: Option<(&Verdict, &ActionOutcome)>,
) {
    match decision {
        Some((verdict, action)) => info!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            author = %message.author_display_name,
            outcome = %outcome,
            is_violation = verdict.is_violation,
            action = %verdict.action,
            action_taken = %action.action_taken,
            severity = %verdict.severity,
            confidence = verdict.confidence,
            categories = ?verdict.violated_categories,
            "Message processed"
        ),
        None => info!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            outcome = %outcome,
            "Message processed"
        ),
    }
}
