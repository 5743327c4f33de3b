//! Baseline classifier: per-category harm severities from Azure AI Content Safety.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClassifierError;
use crate::moderation::types::BaselineScore;

/// Longest text the service accepts in one call.
pub const MAX_TEXT_CHARS: usize = 10_000;

const API_VERSION: &str = "2023-10-01";

/// Scores text by harm category.
#[async_trait]
pub trait BaselineClassifier: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<BaselineScore, ClassifierError>;
}

// ── Content Safety ──────────────────────────────────────────────────

/// Content Safety connection settings.
#[derive(Debug, Clone)]
pub struct ContentSafetyConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    pub timeout: Duration,
}

/// Content Safety `text:analyze` client.
pub struct ContentSafetyClassifier {
    client: reqwest::Client,
    url: String,
    api_key: SecretString,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    text: &'a str,
    categories: [&'static str; 4],
    output_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(default)]
    categories_analysis: Vec<CategoryAnalysis>,
}

#[derive(Debug, Deserialize)]
struct CategoryAnalysis {
    category: String,
    #[serde(default)]
    severity: Option<u8>,
}

impl ContentSafetyClassifier {
    pub fn new(config: &ContentSafetyConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifierError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!(
                "{}/contentsafety/text:analyze?api-version={API_VERSION}",
                config.endpoint.trim_end_matches('/')
            ),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl BaselineClassifier for ContentSafetyClassifier {
    async fn analyze(&self, text: &str) -> Result<BaselineScore, ClassifierError> {
        let text = clip(text, MAX_TEXT_CHARS);
        let body = AnalyzeRequest {
            text,
            categories: ["Hate", "SelfHarm", "Sexual", "Violence"],
            output_type: "FourSeverityLevels",
        };

        let response = self
            .client
            .post(&self.url)
            .header("Ocp-Apim-Subscription-Key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.timeout)
                } else {
                    ClassifierError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ClassifierError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;

        let score = score_from_response(&parsed);
        debug!(
            hate = score.hate,
            self_harm = score.self_harm,
            sexual = score.sexual,
            violence = score.violence,
            "Baseline scores"
        );
        Ok(score)
    }
}

fn score_from_response(response: &AnalyzeResponse) -> BaselineScore {
    BaselineScore::from_pairs(
        response
            .categories_analysis
            .iter()
            .map(|c| (c.category.as_str(), c.severity.unwrap_or(0))),
    )
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
