//! Microsoft Teams access through the Microsoft Graph REST API.
//!
//! Authenticates with the client-credentials flow and caches the token until
//! five minutes before it expires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::PlatformError;
use crate::moderation::types::InboundMessage;
use crate::platform::{ChannelInfo, ChatPlatform, DeleteStatus};
use crate::policy::model::ChannelConfig;
use crate::text::strip_html;

const PLATFORM: &str = "teams";

/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Default Graph endpoints.
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";

// ── Configuration ───────────────────────────────────────────────────

/// Graph connection settings.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub team_id: String,
    pub graph_url: String,
    pub authority_url: String,
    pub timeout: Duration,
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChannel {
    id: String,
    display_name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    message_type: Option<String>,
    created_date_time: Option<DateTime<Utc>>,
    deleted_date_time: Option<DateTime<Utc>>,
    from: Option<GraphFrom>,
    body: Option<GraphBody>,
}

#[derive(Debug, Deserialize)]
struct GraphFrom {
    user: Option<GraphUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content: String,
    content_type: Option<String>,
}

/// Convert a Graph message into an `InboundMessage`. System events, bot
/// posts without a user author, and deleted messages yield `None`.
fn to_inbound(
    message: GraphMessage,
    channel_id: &str,
    channel_name: Option<&str>,
) -> Option<InboundMessage> {
    if message
        .message_type
        .as_deref()
        .is_some_and(|t| t != "message")
    {
        return None;
    }
    if message.deleted_date_time.is_some() {
        return None;
    }

    let user = message.from?.user?;
    let author_id = user.id.filter(|id| !id.is_empty())?;

    let body = message.body.unwrap_or(GraphBody {
        content: String::new(),
        content_type: None,
    });
    let content = match body.content_type.as_deref() {
        Some(t) if t.eq_ignore_ascii_case("html") => strip_html(&body.content),
        _ => body.content.trim().to_string(),
    };

    Some(InboundMessage {
        id: message.id,
        channel_id: channel_id.to_string(),
        channel_name: channel_name.map(str::to_string),
        author_id,
        author_display_name: user.display_name.unwrap_or_else(|| "Unknown".to_string()),
        content,
        created_at: message.created_date_time.unwrap_or_else(Utc::now),
    })
}

// ── Client ──────────────────────────────────────────────────────────

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

/// Teams client over Graph.
pub struct GraphClient {
    client: reqwest::Client,
    config: GraphConfig,
    token: tokio::sync::Mutex<Option<CachedToken>>,
    channel_names: Mutex<HashMap<String, String>>,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PlatformError::RequestFailed {
                platform: PLATFORM.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            config,
            token: tokio::sync::Mutex::new(None),
            channel_names: Mutex::new(HashMap::new()),
        })
    }

    fn team_url(&self) -> String {
        format!(
            "{}/teams/{}",
            self.config.graph_url.trim_end_matches('/'),
            self.config.team_id
        )
    }

    /// Current bearer token, fetching a new one when the cached one is stale.
    async fn access_token(&self) -> Result<SecretString, PlatformError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.token.clone());
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_url.trim_end_matches('/'),
            self.config.tenant_id
        );
        let scope = format!("{}/.default", graph_resource(&self.config.graph_url));
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::AuthFailed {
                platform: PLATFORM.to_string(),
                reason: format!("token endpoint returned {status}: {}", clip(&body)),
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| PlatformError::InvalidResponse {
                    platform: PLATFORM.to_string(),
                    reason: format!("token response: {e}"),
                })?;

        let lifetime = Duration::from_secs(token.expires_in);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        let secret = SecretString::from(token.access_token);
        *cached = Some(CachedToken {
            token: secret.clone(),
            refresh_at,
        });
        debug!(expires_in = token.expires_in, "Graph token acquired");
        Ok(secret)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, PlatformError> {
        let token = self.access_token().await?;
        builder
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> PlatformError {
        if e.is_timeout() {
            PlatformError::Timeout {
                platform: PLATFORM.to_string(),
                timeout: self.config.timeout,
            }
        } else {
            PlatformError::RequestFailed {
                platform: PLATFORM.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn channel_name(&self, channel_id: &str) -> Option<String> {
        self.channel_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .cloned()
    }

    /// Display name for a channel. Channel lists fill the cache; a miss is
    /// looked up once and cached, so name-based exclusions apply to messages
    /// that arrive without a prior channel listing.
    async fn resolve_channel_name(
        &self,
        channel_id: &str,
    ) -> Result<Option<String>, PlatformError> {
        if let Some(name) = self.channel_name(channel_id) {
            return Ok(Some(name));
        }

        let url = format!("{}/channels/{}", self.team_url(), channel_id);
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let channel: GraphChannel = decode(response).await?;
        let Some(name) = channel.display_name else {
            return Ok(None);
        };

        debug!(channel_id, channel_name = %name, "Channel name resolved");
        self.channel_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel_id.to_string(), name.clone());
        Ok(Some(name))
    }
}

/// `https://graph.microsoft.com/v1.0` → `https://graph.microsoft.com`.
fn graph_resource(graph_url: &str) -> String {
    let trimmed = graph_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((base, version)) if is_api_version(version) => base.to_string(),
        _ => trimmed.to_string(),
    }
}

fn is_api_version(segment: &str) -> bool {
    segment == "beta"
        || segment
            .strip_prefix('v')
            .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
}

fn clip(body: &str) -> String {
    body.chars().take(500).collect()
}

/// Map a non-success response into a `PlatformError`.
async fn status_error(response: Response) -> PlatformError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            platform: PLATFORM.to_string(),
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::AuthFailed {
            platform: PLATFORM.to_string(),
            reason: format!("HTTP {status}: {}", clip(&body)),
        },
        _ => PlatformError::Status {
            platform: PLATFORM.to_string(),
            status: status.as_u16(),
            body: clip(&body),
        },
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, PlatformError> {
    response
        .json()
        .await
        .map_err(|e| PlatformError::InvalidResponse {
            platform: PLATFORM.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl ChatPlatform for GraphClient {
    fn name(&self) -> &str {
        PLATFORM
    }

    async fn list_channels(
        &self,
        filter: &ChannelConfig,
    ) -> Result<Vec<ChannelInfo>, PlatformError> {
        let url = format!("{}/channels", self.team_url());
        let response = self.send(self.client.get(&url)).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let list: GraphList<GraphChannel> = decode(response).await?;

        let channels: Vec<ChannelInfo> = list
            .value
            .into_iter()
            .map(|c| ChannelInfo {
                name: c.display_name.unwrap_or_else(|| c.id.clone()),
                id: c.id,
                description: c.description,
            })
            .collect();

        {
            let mut names = self.channel_names.lock().unwrap_or_else(|e| e.into_inner());
            for channel in &channels {
                names.insert(channel.id.clone(), channel.name.clone());
            }
        }

        let selected: Vec<ChannelInfo> = channels
            .into_iter()
            .filter(|c| filter.is_monitored(&c.id, Some(&c.name)))
            .collect();
        info!(count = selected.len(), "Resolved monitored channels");
        Ok(selected)
    }

    async fn fetch_messages_since(
        &self,
        channel: &ChannelInfo,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, PlatformError> {
        let url = format!("{}/channels/{}/messages", self.team_url(), channel.id);
        let top = limit.to_string();
        let response = self
            .send(self.client.get(&url).query(&[("$top", top.as_str())]))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let list: GraphList<GraphMessage> = decode(response).await?;

        let mut messages: Vec<InboundMessage> = list
            .value
            .into_iter()
            .filter_map(|m| to_inbound(m, &channel.id, Some(&channel.name)))
            .filter(|m| m.created_at >= since)
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages.truncate(limit);
        Ok(messages)
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<InboundMessage>, PlatformError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.team_url(),
            channel_id,
            message_id
        );
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let message: GraphMessage = decode(response).await?;
        let channel_name = self.resolve_channel_name(channel_id).await?;
        Ok(to_inbound(message, channel_id, channel_name.as_deref()))
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<DeleteStatus, PlatformError> {
        let url = format!(
            "{}/channels/{}/messages/{}/softDelete",
            self.team_url(),
            channel_id,
            message_id
        );
        let response = self.send(self.client.post(&url)).await?;
        match response.status() {
            s if s.is_success() => Ok(DeleteStatus::Deleted),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(DeleteStatus::AlreadyDeleted),
            _ => Err(status_error(response).await),
        }
    }
}
