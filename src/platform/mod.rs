//! Chat platform access: pure I/O, no moderation logic.
//!
//! The pipeline needs four things from a platform: enumerate channels,
//! read recent messages, resolve one message by id, and delete a message.

pub mod graph;

pub use graph::{GraphClient, GraphConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::moderation::types::InboundMessage;
use crate::policy::model::ChannelConfig;

/// A channel the service can watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

/// Result of a successful delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    /// The message was gone before this call; counts as success.
    AlreadyDeleted,
}

/// Trait for chat platform clients.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Platform name for logs.
    fn name(&self) -> &str;

    /// Channels selected by the allow/deny lists in `filter`.
    async fn list_channels(&self, filter: &ChannelConfig)
    -> Result<Vec<ChannelInfo>, PlatformError>;

    /// User messages created at or after `since`, oldest first, at most `limit`.
    async fn fetch_messages_since(
        &self,
        channel: &ChannelInfo,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError>;

    /// Resolve one message. `None` when it no longer exists or is not a
    /// user message.
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<InboundMessage>, PlatformError>;

    /// Remove a message. Idempotent: a message that is already gone reports
    /// `AlreadyDeleted`.
    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<DeleteStatus, PlatformError>;
}
