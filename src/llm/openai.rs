//! Chat-completions provider for Azure OpenAI deployments and OpenAI-compatible APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use crate::llm::{LlmBackend, LlmConfig};

const AZURE_API_VERSION: &str = "2024-06-01";

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// HTTP provider speaking the chat-completions wire format.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    backend: LlmBackend,
    url: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.backend.as_str().to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            backend: config.backend,
            url: completions_url(config),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: config.timeout,
        })
    }

    fn provider(&self) -> String {
        self.backend.as_str().to_string()
    }
}

/// Build the completions URL for a backend.
fn completions_url(config: &LlmConfig) -> String {
    let base = config.endpoint.trim_end_matches('/');
    match config.backend {
        LlmBackend::AzureOpenAi => format!(
            "{base}/openai/deployments/{}/chat/completions?api-version={AZURE_API_VERSION}",
            config.model
        ),
        LlmBackend::OpenAi => format!("{base}/chat/completions"),
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let builder = self.client.post(&self.url).json(&body);
        let builder = match self.backend {
            LlmBackend::AzureOpenAi => builder.header("api-key", self.api_key.expose_secret()),
            LlmBackend::OpenAi => builder.bearer_auth(self.api_key.expose_secret()),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    provider: self.provider(),
                    timeout: self.timeout,
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.provider(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(self.provider(), status, retry_after, &body));
        }

        let wire: WireResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: self.provider(),
            reason: format!("Undecodable completion body: {e}"),
        })?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.provider(),
                reason: "Completion had no choices".to_string(),
            })?;
        let usage = wire.usage.unwrap_or_default();

        debug!(
            model = %self.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
            response_id: wire.id,
        })
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_error(
    provider: String,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed { provider },
        _ => LlmError::Status {
            provider,
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, endpoint: &str) -> LlmConfig {
        LlmConfig {
            backend,
            endpoint: endpoint.to_string(),
            api_key: SecretString::from("test-key"),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn azure_url_targets_deployment() {
        let url = completions_url(&config(
            LlmBackend::AzureOpenAi,
            "https://example.openai.azure.com/",
        ));
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn openai_url_appends_path() {
        let url = completions_url(&config(LlmBackend::OpenAi, "https://api.openai.com/v1"));
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn status_mapping() {
        let err = status_error("azure".into(), StatusCode::TOO_MANY_REQUESTS, None, "");
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert!(err.is_transient());

        let err = status_error("azure".into(), StatusCode::UNAUTHORIZED, None, "");
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        assert!(!err.is_transient());

        let err = status_error("azure".into(), StatusCode::BAD_GATEWAY, None, "upstream");
        assert!(err.is_transient());
    }

    #[test]
    fn wire_response_decodes() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "{}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(wire.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(wire.choices.len(), 1);
        assert_eq!(wire.usage.unwrap().prompt_tokens, 12);
    }
}
