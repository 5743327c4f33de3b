//! Configuration sources for the policy and channel documents.
//!
//! - `RemoteConfigSource`: HTTP key-value configuration service
//! - `LocalFileSource`: `<dir>/<name>.json`, falling back to `<name>.example.json`
//! - `LayeredConfigSource`: remote first, local on failure; writes go to both

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// The two documents the service reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDocument {
    Policies,
    Channels,
}

impl ConfigDocument {
    /// Remote key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Policies => "policies",
            Self::Channels => "channels",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.key())
    }

    pub fn example_file_name(&self) -> String {
        format!("{}.example.json", self.key())
    }
}

/// A document as loaded, with the layer that produced it.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub value: serde_json::Value,
    pub origin: String,
}

/// Read/write access to named JSON documents.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, document: ConfigDocument) -> Result<LoadedDocument, ConfigError>;

    async fn save(
        &self,
        document: ConfigDocument,
        value: &serde_json::Value,
    ) -> Result<(), ConfigError>;
}

// ── Local files ─────────────────────────────────────────────────────

/// Documents stored as files in one directory.
pub struct LocalFileSource {
    dir: PathBuf,
}

impl LocalFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_json(&self, file_name: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        let path = self.dir.join(file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }
}

#[async_trait]
impl ConfigSource for LocalFileSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, document: ConfigDocument) -> Result<LoadedDocument, ConfigError> {
        if let Some(value) = self.read_json(&document.file_name()).await? {
            return Ok(LoadedDocument {
                value,
                origin: "local".to_string(),
            });
        }

        debug!(
            document = document.key(),
            "No local document, trying example file"
        );
        match self.read_json(&document.example_file_name()).await? {
            Some(value) => Ok(LoadedDocument {
                value,
                origin: "local-example".to_string(),
            }),
            None => Err(ConfigError::NotFound {
                key: document.key().to_string(),
            }),
        }
    }

    async fn save(
        &self,
        document: ConfigDocument,
        value: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let rendered = serde_json::to_string_pretty(value)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Write then rename so readers never see a half-written file.
        let target = self.dir.join(document.file_name());
        let staging = self.dir.join(format!(".{}.tmp", document.file_name()));
        tokio::fs::write(&staging, rendered).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }
}

// ── Remote key-value service ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RemoteEntry {
    value: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RemoteWrite<'a> {
    value: String,
    content_type: &'a str,
}

/// Documents stored as string values under `<base>/kv/<key>`.
pub struct RemoteConfigSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl RemoteConfigSource {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, document: ConfigDocument) -> String {
        format!("{}/kv/{}", self.base_url, document.key())
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

fn unavailable(reason: String) -> ConfigError {
    ConfigError::Unavailable {
        source_name: "remote".to_string(),
        reason,
    }
}

#[async_trait]
impl ConfigSource for RemoteConfigSource {
    fn name(&self) -> &str {
        "remote"
    }

    async fn load(&self, document: ConfigDocument) -> Result<LoadedDocument, ConfigError> {
        let response = self
            .authorize(self.client.get(self.url(document)))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ConfigError::NotFound {
                key: document.key().to_string(),
            });
        }
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {status}")));
        }

        let entry: RemoteEntry = response
            .json()
            .await
            .map_err(|e| ConfigError::ParseError(format!("remote {}: {e}", document.key())))?;

        // Values are stored as JSON strings; accept inline objects too.
        let value = match entry.value {
            serde_json::Value::String(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::ParseError(format!("remote {}: {e}", document.key())))?,
            other => other,
        };

        Ok(LoadedDocument {
            value,
            origin: "remote".to_string(),
        })
    }

    async fn save(
        &self,
        document: ConfigDocument,
        value: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        let body = RemoteWrite {
            value: value.to_string(),
            content_type: "application/json",
        };
        let response = self
            .authorize(self.client.put(self.url(document)).json(&body))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

// ── Layered ─────────────────────────────────────────────────────────

/// Remote-first source with a local fallback.
pub struct LayeredConfigSource {
    remote: Option<Arc<dyn ConfigSource>>,
    local: Arc<dyn ConfigSource>,
}

impl LayeredConfigSource {
    pub fn new(remote: Option<Arc<dyn ConfigSource>>, local: Arc<dyn ConfigSource>) -> Self {
        Self { remote, local }
    }
}

#[async_trait]
impl ConfigSource for LayeredConfigSource {
    fn name(&self) -> &str {
        "layered"
    }

    async fn load(&self, document: ConfigDocument) -> Result<LoadedDocument, ConfigError> {
        if let Some(remote) = &self.remote {
            match remote.load(document).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) => warn!(
                    document = document.key(),
                    error = %e,
                    "Remote config load failed, falling back to local"
                ),
            }
        }
        self.local.load(document).await
    }

    async fn save(
        &self,
        document: ConfigDocument,
        value: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        let remote_result = match &self.remote {
            Some(remote) => Some(remote.save(document, value).await),
            None => None,
        };
        let local_result = self.local.save(document, value).await;

        match (remote_result, local_result) {
            (Some(Err(remote_err)), Err(local_err)) => {
                warn!(error = %remote_err, "Remote config save failed");
                Err(local_err)
            }
            (Some(Err(e)), Ok(())) => {
                warn!(
                    document = document.key(),
                    error = %e,
                    "Remote config save failed, saved locally only"
                );
                Ok(())
            }
            (Some(Ok(())), Err(e)) => {
                warn!(
                    document = document.key(),
                    error = %e,
                    "Local config save failed, saved remotely only"
                );
                Ok(())
            }
            (None, result) => result,
            (Some(Ok(())), Ok(())) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl ConfigSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn load(&self, _document: ConfigDocument) -> Result<LoadedDocument, ConfigError> {
            Err(unavailable("connection refused".into()))
        }

        async fn save(
            &self,
            _document: ConfigDocument,
            _value: &serde_json::Value,
        ) -> Result<(), ConfigError> {
            Err(unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn local_prefers_real_file_over_example() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policies.example.json"), r#"{"from":"example"}"#).unwrap();
        let source = LocalFileSource::new(dir.path());

        let loaded = source.load(ConfigDocument::Policies).await.unwrap();
        assert_eq!(loaded.value["from"], "example");
        assert_eq!(loaded.origin, "local-example");

        std::fs::write(dir.path().join("policies.json"), r#"{"from":"real"}"#).unwrap();
        let loaded = source.load(ConfigDocument::Policies).await.unwrap();
        assert_eq!(loaded.value["from"], "real");
        assert_eq!(loaded.origin, "local");
    }

    #[tokio::test]
    async fn local_missing_document_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalFileSource::new(dir.path());
        let result = source.load(ConfigDocument::Channels).await;
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[tokio::test]
    async fn local_malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("channels.json"), "{ not json").unwrap();
        let source = LocalFileSource::new(dir.path());
        let result = source.load(ConfigDocument::Channels).await;
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[tokio::test]
    async fn local_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalFileSource::new(dir.path().join("nested"));
        let value = serde_json::json!({"monitored_channels": ["General"]});

        source.save(ConfigDocument::Channels, &value).await.unwrap();
        let loaded = source.load(ConfigDocument::Channels).await.unwrap();
        assert_eq!(loaded.value, value);
    }

    #[tokio::test]
    async fn layered_falls_back_to_local_when_remote_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policies.json"), r#"{"text_policies":{}}"#).unwrap();
        let layered = LayeredConfigSource::new(
            Some(Arc::new(FailingSource)),
            Arc::new(LocalFileSource::new(dir.path())),
        );

        let loaded = layered.load(ConfigDocument::Policies).await.unwrap();
        assert_eq!(loaded.origin, "local");
    }

    #[tokio::test]
    async fn layered_save_succeeds_when_one_layer_does() {
        let dir = tempfile::tempdir().unwrap();
        let layered = LayeredConfigSource::new(
            Some(Arc::new(FailingSource)),
            Arc::new(LocalFileSource::new(dir.path())),
        );
        layered
            .save(ConfigDocument::Policies, &serde_json::json!({}))
            .await
            .unwrap();
        assert!(dir.path().join("policies.json").exists());
    }
}
