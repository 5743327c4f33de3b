//! HTTP surface: health, platform change notifications, config editing,
//! dead-letter inspection.

use std::sync::{Arc, LazyLock};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use regex::Regex;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::pipeline::ledger::ProcessedLedger;
use crate::pipeline::queue::{InMemoryQueue, QueueEnvelope};
use crate::policy::model::{ChannelConfig, PolicyTable};
use crate::policy::source::{ConfigDocument, ConfigSource};
use crate::policy::store::PolicyStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<PolicyStore>,
    pub config_source: Arc<dyn ConfigSource>,
    pub ledger: Arc<ProcessedLedger>,
    /// Present in queue ingestion mode; notifications are dropped otherwise.
    pub queue: Option<Arc<InMemoryQueue>>,
}

/// Build the Axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/teams", post(teams_webhook))
        .route("/api/policies", get(get_policies).put(put_policies))
        .route("/api/channels", get(get_channels).put(put_channels))
        .route("/api/dead-letters", get(list_dead_letters))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.store.current_snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "service": "teams-moderator",
        "policy_version": snapshot.version,
        "policy_origin": snapshot.origin,
        "tracked_messages": state.ledger.len(),
    }))
}

// ── Change notifications ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeNotificationBatch {
    #[serde(default)]
    value: Vec<ChangeNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNotification {
    #[serde(default)]
    change_type: String,
    #[serde(default)]
    resource: String,
    subscription_id: Option<String>,
}

static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"teams\('([^']+)'\)/channels\('([^']+)'\)/messages\('([^']+)'\)")
        .expect("resource pattern is valid")
});

/// Extract team, channel and message ids from a notification resource path.
pub fn parse_resource(resource: &str) -> Option<QueueEnvelope> {
    let caps = RESOURCE_RE.captures(resource)?;
    Some(QueueEnvelope {
        team_id: caps[1].to_string(),
        channel_id: caps[2].to_string(),
        message_id: caps[3].to_string(),
    })
}

async fn teams_webhook(
    State(state): State<ApiState>,
    Query(query): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    // Subscription handshake: echo the token as plain text.
    if let Some(token) = query.validation_token {
        info!("Change-notification subscription validated");
        return (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }

    let batch: ChangeNotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid notification: {e}"));
        }
    };

    let mut accepted = 0;
    for notification in batch.value {
        if notification.change_type != "created" {
            debug!(change_type = %notification.change_type, "Ignoring change notification");
            continue;
        }
        let Some(envelope) = parse_resource(&notification.resource) else {
            warn!(resource = %notification.resource, "Unrecognized notification resource");
            continue;
        };
        let Some(queue) = &state.queue else {
            debug!(message_id = %envelope.message_id, "No queue configured, notification dropped");
            continue;
        };

        match queue.enqueue(envelope) {
            Ok(_) => accepted += 1,
            Err(QueueError::Full) => warn!(
                subscription_id = ?notification.subscription_id,
                "Queue full, notification dropped"
            ),
            Err(e) => warn!(error = %e, "Failed to enqueue notification"),
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": accepted})),
    )
        .into_response()
}

// ── Config ──────────────────────────────────────────────────────────

async fn get_policies(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.store.current_snapshot().policies.clone())
}

async fn put_policies(
    State(state): State<ApiState>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    let table = match PolicyTable::from_value(value.clone()) {
        Ok(table) => table,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if let Err(e) = state
        .config_source
        .save(ConfigDocument::Policies, &value)
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let version = state.store.replace_policies(table);
    info!(version, "Policies updated through API");
    Json(serde_json::json!({"status": "saved", "version": version})).into_response()
}

async fn get_channels(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.store.current_snapshot().channels.clone())
}

async fn put_channels(
    State(state): State<ApiState>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    let channels = match ChannelConfig::from_value(value.clone()) {
        Ok(channels) => channels,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if let Err(e) = state
        .config_source
        .save(ConfigDocument::Channels, &value)
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let version = state.store.replace_channels(channels);
    info!(version, "Channel config updated through API");
    Json(serde_json::json!({"status": "saved", "version": version})).into_response()
}

// ── Dead letters ────────────────────────────────────────────────────

async fn list_dead_letters(State(state): State<ApiState>) -> impl IntoResponse {
    let dead = state
        .queue
        .as_ref()
        .map(|q| q.dead_letters())
        .unwrap_or_default();
    Json(dead)
}
