//! Periodic reload of the policy and channel documents.
//!
//! A failed refresh leaves the current snapshot in place; the service keeps
//! enforcing the last configuration it loaded successfully.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::policy::model::{ChannelConfig, PolicyTable};
use crate::policy::source::{ConfigDocument, ConfigSource};
use crate::policy::store::PolicyStore;

/// Default refresh period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Parsed documents ready to install.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub policies: PolicyTable,
    pub channels: ChannelConfig,
    pub origin: String,
}

/// Load and parse both documents. Every failure is an error, including a
/// document missing from every layer.
pub async fn load_config(source: &dyn ConfigSource) -> Result<LoadedConfig, ConfigError> {
    let policies = source.load(ConfigDocument::Policies).await?;
    let channels = source.load(ConfigDocument::Channels).await?;

    Ok(LoadedConfig {
        policies: PolicyTable::from_value(policies.value)?,
        channels: ChannelConfig::from_value(channels.value)?,
        origin: policies.origin,
    })
}

/// Like [`load_config`], but a policy document missing from every layer falls
/// back to the built-in policy set, and a missing channel document to "watch
/// everything". Only used before any snapshot exists.
pub async fn load_config_or_defaults(
    source: &dyn ConfigSource,
) -> Result<LoadedConfig, ConfigError> {
    let (policies, origin) = match source.load(ConfigDocument::Policies).await {
        Ok(loaded) => (PolicyTable::from_value(loaded.value)?, loaded.origin),
        Err(ConfigError::NotFound { .. }) => {
            warn!("No policy document found, using built-in policies");
            (PolicyTable::builtin(), "builtin".to_string())
        }
        Err(e) => return Err(e),
    };

    let channels = match source.load(ConfigDocument::Channels).await {
        Ok(loaded) => ChannelConfig::from_value(loaded.value)?,
        Err(ConfigError::NotFound { .. }) => {
            warn!("No channel document found, watching every channel");
            ChannelConfig::default()
        }
        Err(e) => return Err(e),
    };

    Ok(LoadedConfig {
        policies,
        channels,
        origin,
    })
}

/// Build the store at startup. Failure here is fatal for the process.
pub async fn bootstrap_store(source: &dyn ConfigSource) -> Result<PolicyStore, ConfigError> {
    let loaded = load_config_or_defaults(source).await?;
    info!(
        origin = %loaded.origin,
        rules = loaded.policies.text_policies.len(),
        monitored = loaded.channels.monitored_channels.len(),
        "Moderation config loaded"
    );
    Ok(PolicyStore::with_origin(
        loaded.policies,
        loaded.channels,
        &loaded.origin,
    ))
}

/// Reloads configuration into a `PolicyStore` on a fixed period.
pub struct ConfigRefresher {
    source: Arc<dyn ConfigSource>,
    store: Arc<PolicyStore>,
    interval: Duration,
}

impl ConfigRefresher {
    pub fn new(source: Arc<dyn ConfigSource>, store: Arc<PolicyStore>, interval: Duration) -> Self {
        Self {
            source,
            store,
            interval,
        }
    }

    /// Reload once. Returns the version in effect afterwards.
    ///
    /// Identical documents do not produce a new version. A document that has
    /// disappeared is a failed refresh, not a reset to defaults.
    pub async fn refresh_once(&self) -> Result<u64, ConfigError> {
        let loaded = load_config(self.source.as_ref()).await?;
        let current = self.store.current_snapshot();

        let policies = loaded.policies.normalized();
        if policies == current.policies && loaded.channels == current.channels {
            debug!(version = current.version, "Config unchanged");
            return Ok(current.version);
        }

        Ok(self
            .store
            .replace(policies, loaded.channels, &loaded.origin))
    }

    /// Run until `shutdown` flips to true. The first reload happens one
    /// interval after start, since the store was populated at bootstrap.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Config refresher running every {}s", self.interval.as_secs());
            let start = tokio::time::Instant::now() + self.interval;
            let mut tick = tokio::time::interval_at(start, self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.refresh_once().await {
                            let version = self.store.current_snapshot().version;
                            warn!(error = %e, version, "Config refresh failed, keeping current snapshot");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Config refresher shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }
}
