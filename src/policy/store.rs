//! Live policy store.
//!
//! Readers take an `Arc` to an immutable snapshot; writers swap the pointer.
//! A reader therefore always sees one complete policy version, and a replace
//! never blocks on in-flight evaluations.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::model::{ChannelConfig, PolicyTable};

/// One immutable version of the moderation configuration.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySnapshot {
    pub policies: PolicyTable,
    pub channels: ChannelConfig,
    /// Monotonic version, starting at 1.
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    /// Where the snapshot came from ("remote", "local", "builtin", "api").
    pub origin: String,
}

/// Holder of the current snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(policies: PolicyTable, channels: ChannelConfig) -> Self {
        Self::with_origin(policies, channels, "builtin")
    }

    pub fn with_origin(policies: PolicyTable, channels: ChannelConfig, origin: &str) -> Self {
        let snapshot = PolicySnapshot {
            policies: policies.normalized(),
            channels,
            version: 1,
            loaded_at: Utc::now(),
            origin: origin.to_string(),
        };
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot in effect right now.
    pub fn current_snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install a new policy table and channel config together. Returns the new version.
    pub fn replace(&self, policies: PolicyTable, channels: ChannelConfig, origin: &str) -> u64 {
        self.update(origin, |_| (policies.normalized(), channels))
    }

    /// Install a new policy table, keeping the channel config.
    pub fn replace_policies(&self, policies: PolicyTable) -> u64 {
        self.update("api", |current| {
            (policies.normalized(), current.channels.clone())
        })
    }

    /// Install a new channel config, keeping the policy table.
    pub fn replace_channels(&self, channels: ChannelConfig) -> u64 {
        self.update("api", |current| (current.policies.clone(), channels))
    }

    fn update(
        &self,
        origin: &str,
        build: impl FnOnce(&PolicySnapshot) -> (PolicyTable, ChannelConfig),
    ) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let (policies, channels) = build(&guard);
        let version = guard.version + 1;
        *guard = Arc::new(PolicySnapshot {
            policies,
            channels,
            version,
            loaded_at: Utc::now(),
            origin: origin.to_string(),
        });
        tracing::info!(version, origin, "Policy snapshot replaced");
        version
    }
}
