//! Per-message processing stages and the pipeline's result record.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::moderation::types::Verdict;
use crate::notify::NotificationOutcome;
use crate::pipeline::actions::ActionOutcome;
use crate::pipeline::ledger::Outcome;

/// Where a message is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStage {
    Received,
    Classifying,
    Deciding,
    Acting,
    Notifying,
    Done,
    /// Unrecoverable error; absorbing.
    Failed,
}

impl MessageStage {
    /// Check if this stage allows moving to `target`.
    pub fn can_transition_to(&self, target: MessageStage) -> bool {
        use MessageStage::*;

        if target == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            // Duplicates, skipped channels and empty content finish early
            (Received, Classifying) | (Received, Done) |
            (Classifying, Deciding) |
            (Deciding, Acting) |
            // No notification requested
            (Acting, Notifying) | (Acting, Done) |
            (Notifying, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for MessageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Classifying => "classifying",
            Self::Deciding => "deciding",
            Self::Acting => "acting",
            Self::Notifying => "notifying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Tracks one message's stage and rejects illegal jumps.
#[derive(Debug, Clone)]
pub struct StageTracker {
    message_key: String,
    stage: MessageStage,
}

impl StageTracker {
    pub fn new(message_key: impl Into<String>) -> Self {
        Self {
            message_key: message_key.into(),
            stage: MessageStage::Received,
        }
    }

    pub fn stage(&self) -> MessageStage {
        self.stage
    }

    /// Advance to `next`. An illegal transition is a programming error; it is
    /// logged and the stage is left unchanged.
    pub fn advance(&mut self, next: MessageStage) {
        if self.stage.can_transition_to(next) {
            tracing::trace!(
                message = %self.message_key,
                from = %self.stage,
                to = %next,
                "Stage transition"
            );
            self.stage = next;
        } else {
            tracing::error!(
                message = %self.message_key,
                from = %self.stage,
                to = %next,
                "Illegal stage transition"
            );
        }
    }
}

/// Why a message finished without classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortCircuit {
    /// Already seen within the dedup window.
    Duplicate,
    /// Channel excluded or not in the monitored list.
    ChannelNotMonitored,
    /// Nothing left to classify after normalization.
    EmptyContent,
}

/// Result of running one message through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub channel_id: String,
    pub stage: MessageStage,
    /// `None` for duplicates, whose outcome belongs to the first delivery.
    pub outcome: Option<Outcome>,
    pub short_circuit: Option<ShortCircuit>,
    pub verdict: Option<Verdict>,
    pub action: Option<ActionOutcome>,
    pub notification: Option<NotificationOutcome>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedMessage {
    pub fn is_duplicate(&self) -> bool {
        self.short_circuit == Some(ShortCircuit::Duplicate)
    }
}
