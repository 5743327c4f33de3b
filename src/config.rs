//! Process configuration, read from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::moderation::baseline::ContentSafetyConfig;
use crate::notify::EmailConfig;
use crate::pipeline::ingest::IngestSettings;
use crate::pipeline::processor::PipelineSettings;
use crate::pipeline::retry::RetryPolicy;
use crate::platform::graph::{DEFAULT_AUTHORITY_URL, DEFAULT_GRAPH_URL, GraphConfig};

/// `monitor` only reports; `enforce` deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationMode {
    Monitor,
    Enforce,
}

impl std::str::FromStr for ModerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monitor" => Ok(Self::Monitor),
            "enforce" => Ok(Self::Enforce),
            other => Err(format!("expected 'monitor' or 'enforce', got '{other}'")),
        }
    }
}

/// Where messages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Poll every monitored channel on an interval.
    Poll,
    /// Drain envelopes pushed by the change-notification endpoint.
    Queue,
}

impl std::str::FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(Self::Poll),
            "queue" | "webhook" => Ok(Self::Queue),
            other => Err(format!("expected 'poll' or 'queue', got '{other}'")),
        }
    }
}

/// Remote key-value config service.
#[derive(Debug, Clone)]
pub struct RemoteConfigSettings {
    pub endpoint: String,
    pub token: Option<SecretString>,
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct ModeratorConfig {
    pub graph: GraphConfig,
    pub content_safety: ContentSafetyConfig,
    pub llm: LlmConfig,
    pub webhook_url: Option<String>,
    pub email: Option<EmailConfig>,
    pub remote_config: Option<RemoteConfigSettings>,
    pub config_dir: PathBuf,
    pub mode: ModerationMode,
    /// Effective dry-run flag: set by `DRY_RUN` or implied by monitor mode.
    pub dry_run: bool,
    pub ingest_mode: IngestMode,
    pub poll_interval: Duration,
    pub poll_lookback: Duration,
    pub poll_batch_limit: usize,
    pub config_refresh_interval: Duration,
    pub workers: usize,
    pub external_timeout: Duration,
    pub retry: RetryPolicy,
    pub dedup_capacity: usize,
    pub shutdown_grace: Duration,
    pub http_port: u16,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl ModeratorConfig {
    /// Read the process environment. Call `dotenvy::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));
        let secs = |key: &str, default: u64| {
            Duration::from_secs(get(key).and_then(|s| s.parse().ok()).unwrap_or(default))
        };
        let number = |key: &str, default: usize| -> usize {
            get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };

        let external_timeout = secs("EXTERNAL_TIMEOUT_SECS", 20);

        let graph = GraphConfig {
            tenant_id: required("TEAMS_TENANT_ID")?,
            client_id: required("TEAMS_CLIENT_ID")?,
            client_secret: SecretString::from(required("TEAMS_CLIENT_SECRET")?),
            team_id: required("TEAMS_TEAM_ID")?,
            graph_url: get("GRAPH_BASE_URL").unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string()),
            authority_url: get("GRAPH_AUTHORITY_URL")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_URL.to_string()),
            timeout: external_timeout,
        };

        let content_safety = ContentSafetyConfig {
            endpoint: required("CONTENT_SAFETY_ENDPOINT")?,
            api_key: SecretString::from(required("CONTENT_SAFETY_KEY")?),
            timeout: external_timeout,
        };

        let backend = parse_enum(get("LLM_BACKEND"), "LLM_BACKEND", LlmBackend::AzureOpenAi)?;
        let llm = LlmConfig {
            backend,
            endpoint: required("FOUNDRY_PROJECT_ENDPOINT")?,
            api_key: SecretString::from(required("FOUNDRY_API_KEY")?),
            model: required("FOUNDRY_MODEL_DEPLOYMENT")?,
            timeout: external_timeout,
        };

        let mode = parse_enum(
            get("MODERATION_MODE"),
            "MODERATION_MODE",
            ModerationMode::Monitor,
        )?;
        let forced_dry_run = get("DRY_RUN").is_some_and(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        });
        let dry_run = mode == ModerationMode::Monitor || forced_dry_run;
        let ingest_mode = parse_enum(get("INGEST_MODE"), "INGEST_MODE", IngestMode::Poll)?;

        let remote_config = get("APP_CONFIG_ENDPOINT").map(|endpoint| RemoteConfigSettings {
            endpoint,
            token: get("APP_CONFIG_TOKEN").map(SecretString::from),
        });

        let retry = RetryPolicy::new(
            get("RETRY_MAX_ATTEMPTS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            Duration::from_millis(
                get("RETRY_BASE_DELAY_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
        );

        let http_port: u16 = get("HTTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        Ok(Self {
            graph,
            content_safety,
            llm,
            webhook_url: get("NOTIFICATION_WEBHOOK"),
            email: EmailConfig::from_lookup(&get, external_timeout),
            remote_config,
            config_dir: PathBuf::from(get("CONFIG_DIR").unwrap_or_else(|| "./config".to_string())),
            mode,
            dry_run,
            ingest_mode,
            poll_interval: secs("POLLING_INTERVAL_SECS", 60),
            poll_lookback: secs("POLL_LOOKBACK_SECS", 300),
            poll_batch_limit: number("POLL_BATCH_LIMIT", 50),
            config_refresh_interval: secs("CONFIG_REFRESH_INTERVAL_SECS", 300),
            workers: number("WORKER_COUNT", 4).max(1),
            external_timeout,
            retry,
            dedup_capacity: number("DEDUP_CAPACITY", 10_000),
            shutdown_grace: secs("SHUTDOWN_GRACE_SECS", 30),
            http_port,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: get("LOG_FILE").map(PathBuf::from),
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            dry_run: self.dry_run,
            retry: self.retry,
            call_timeout: self.external_timeout,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            workers: self.workers,
            poll_interval: self.poll_interval,
            lookback: self.poll_lookback,
            batch_limit: self.poll_batch_limit,
            call_timeout: self.external_timeout,
            retry: self.retry,
            ..IngestSettings::default()
        }
    }
}

fn parse_enum<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    match raw {
        Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        }),
        None => Ok(default),
    }
}
