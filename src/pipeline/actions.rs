//! Action executor: applies a verdict to the platform.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::moderation::types::{InboundMessage, PolicyAction, Verdict};
use crate::platform::{ChatPlatform, DeleteStatus};

/// What the executor actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Allowed,
    /// Delete requested while in dry-run mode; nothing was called.
    WouldDelete,
    Deleted,
    DeleteFailed,
    Flagged,
    Archived,
}

impl ActionTaken {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::WouldDelete => "would_delete",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "delete_failed",
            Self::Flagged => "flagged",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for ActionTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `ActionExecutor::execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub action_taken: ActionTaken,
    pub error: Option<String>,
}

impl ActionOutcome {
    fn ok(action_taken: ActionTaken) -> Self {
        Self {
            action_taken,
            error: None,
        }
    }
}

/// Carries out the verdict's action.
///
/// Flag and archive are routing labels for reviewers and make no platform
/// call. Delete is attempted once per invocation and never retried here: a
/// failed delete is reported, and retrying is the caller's decision.
pub struct ActionExecutor {
    platform: Arc<dyn ChatPlatform>,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(platform: Arc<dyn ChatPlatform>, timeout: Duration) -> Self {
        Self { platform, timeout }
    }

    pub async fn execute(
        &self,
        message: &InboundMessage,
        verdict: &Verdict,
        dry_run: bool,
    ) -> ActionOutcome {
        match verdict.action {
            PolicyAction::Allow => ActionOutcome::ok(ActionTaken::Allowed),
            PolicyAction::Flag => ActionOutcome::ok(ActionTaken::Flagged),
            PolicyAction::Archive => ActionOutcome::ok(ActionTaken::Archived),
            PolicyAction::Delete if dry_run => {
                info!(
                    message_id = %message.id,
                    channel_id = %message.channel_id,
                    "Dry run, message would be deleted"
                );
                ActionOutcome::ok(ActionTaken::WouldDelete)
            }
            PolicyAction::Delete => self.delete(message).await,
        }
    }

    async fn delete(&self, message: &InboundMessage) -> ActionOutcome {
        let call = self
            .platform
            .delete_message(&message.channel_id, &message.id);

        let error = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(status)) => {
                info!(
                    message_id = %message.id,
                    channel_id = %message.channel_id,
                    already_deleted = status == DeleteStatus::AlreadyDeleted,
                    "Message deleted"
                );
                return ActionOutcome::ok(ActionTaken::Deleted);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("delete timed out after {}s", self.timeout.as_secs()),
        };

        warn!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            platform = self.platform.name(),
            error = %error,
            "Delete failed"
        );
        ActionOutcome {
            action_taken: ActionTaken::DeleteFailed,
            error: Some(error),
        }
    }
}
