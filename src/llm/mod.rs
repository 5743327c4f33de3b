//! LLM integration for the contextual judge and the notification composer.
//!
//! Supports:
//! - **Azure OpenAI**: deployment-scoped chat completions with an `api-key` header
//! - **OpenAI-compatible**: `/chat/completions` with bearer auth
//!
//! Both speak the same wire format through `OpenAiCompatibleProvider`, which
//! implements our `LlmProvider` trait.

pub mod openai;
pub mod provider;

pub use openai::OpenAiCompatibleProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    AzureOpenAi,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AzureOpenAi => "azure",
            Self::OpenAi => "openai",
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure" | "azure_openai" | "foundry" => Ok(Self::AzureOpenAi),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub endpoint: String,
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatibleProvider::new(config)?;
    tracing::info!(
        "Using {} (model: {})",
        config.backend.as_str(),
        config.model
    );
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_azure_provider() {
        let config = LlmConfig {
            backend: LlmBackend::AzureOpenAi,
            endpoint: "https://example.openai.azure.com".to_string(),
            api_key: secrecy::SecretString::from("test-key"),
            model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(20),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("azure".parse::<LlmBackend>(), Ok(LlmBackend::AzureOpenAi));
        assert_eq!("OpenAI".parse::<LlmBackend>(), Ok(LlmBackend::OpenAi));
        assert!("bedrock".parse::<LlmBackend>().is_err());
    }
}
