//! Policy and channel configuration documents.
//!
//! Both are stored as JSON. The policy document maps normalized category names
//! to enforcement rules; the channel document selects which channels are watched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::moderation::decision::normalize_category;
use crate::moderation::types::{PolicyAction, Severity};

// ── Policy rules ────────────────────────────────────────────────────

/// Enforcement rule for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rule_action")]
    pub action: PolicyAction,
    #[serde(default)]
    pub notify: bool,
    /// Descriptive only; the decision engine does not gate on it.
    #[serde(default = "default_rule_threshold")]
    pub threshold: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_rule_action() -> PolicyAction {
    PolicyAction::Flag
}

fn default_rule_threshold() -> Severity {
    Severity::Medium
}

impl PolicyRule {
    pub fn new(action: PolicyAction, notify: bool) -> Self {
        Self {
            enabled: true,
            action,
            notify,
            threshold: Severity::Medium,
            description: None,
        }
    }

    pub fn with_threshold(mut self, threshold: Severity) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The full policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub text_policies: BTreeMap<String, PolicyRule>,
    /// Reserved for image moderation; never evaluated.
    #[serde(default)]
    pub image_policies: BTreeMap<String, PolicyRule>,
    /// Human descriptions of each action.
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    /// Human descriptions of each threshold level.
    #[serde(default)]
    pub thresholds: BTreeMap<String, serde_json::Value>,
}

impl PolicyTable {
    /// Parse a policy document and normalize its rule keys.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let table: PolicyTable = serde_json::from_value(value)
            .map_err(|e| ConfigError::ParseError(format!("policies: {e}")))?;
        Ok(table.normalized())
    }

    /// Re-key rules by normalized category name. On key collisions the last
    /// rule in document order wins.
    pub fn normalized(self) -> Self {
        fn normalize(rules: BTreeMap<String, PolicyRule>) -> BTreeMap<String, PolicyRule> {
            rules
                .into_iter()
                .map(|(k, v)| (normalize_category(&k), v))
                .collect()
        }

        Self {
            text_policies: normalize(self.text_policies),
            image_policies: normalize(self.image_policies),
            actions: self.actions,
            thresholds: self.thresholds,
        }
    }

    /// Look up the text rule for a category name.
    pub fn rule(&self, category: &str) -> Option<&PolicyRule> {
        self.text_policies.get(&normalize_category(category))
    }

    pub fn with_rule(mut self, category: &str, rule: PolicyRule) -> Self {
        self.text_policies.insert(normalize_category(category), rule);
        self
    }

    /// Built-in policy set used when no document can be found anywhere.
    pub fn builtin() -> Self {
        Self::default()
            .with_rule(
                "hate_speech",
                PolicyRule::new(PolicyAction::Delete, true)
                    .with_description("Content that attacks or demeans a group"),
            )
            .with_rule(
                "profanity",
                PolicyRule::new(PolicyAction::Flag, false)
                    .with_threshold(Severity::High)
                    .with_description("Offensive or vulgar language"),
            )
            .with_rule(
                "violence",
                PolicyRule::new(PolicyAction::Delete, true)
                    .with_description("Threats or glorification of violence"),
            )
            .with_rule(
                "self_harm",
                PolicyRule::new(PolicyAction::Delete, true)
                    .with_threshold(Severity::Low)
                    .with_description("Content promoting self-harm"),
            )
            .with_rule(
                "sexual_content",
                PolicyRule::new(PolicyAction::Delete, true)
                    .with_description("Sexually explicit content"),
            )
            .with_rule(
                "pii_leak",
                PolicyRule::new(PolicyAction::Flag, true)
                    .with_description("Personal or confidential information shared in a channel"),
            )
    }
}

// ── Channel configuration ───────────────────────────────────────────

/// Polling and scanning switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_true")]
    pub enable_real_time: bool,
    #[serde(default)]
    pub enable_batch_scan: bool,
    #[serde(default = "default_batch_interval")]
    pub batch_interval_minutes: u32,
}

fn default_true() -> bool {
    true
}

fn default_batch_interval() -> u32 {
    60
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enable_real_time: true,
            enable_batch_scan: false,
            batch_interval_minutes: default_batch_interval(),
        }
    }
}

/// Which channels are moderated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel names or ids to watch. Empty means every channel.
    #[serde(default)]
    pub monitored_channels: Vec<String>,
    /// Channel names or ids never watched, even when listed above.
    #[serde(default)]
    pub excluded_channels: Vec<String>,
    #[serde(default)]
    pub monitoring_settings: MonitoringSettings,
}

impl ChannelConfig {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::ParseError(format!("channels: {e}")))
    }

    /// Whether a channel, identified by id and optional display name, is moderated.
    pub fn is_monitored(&self, channel_id: &str, channel_name: Option<&str>) -> bool {
        let matches = |entry: &String| {
            entry.eq_ignore_ascii_case(channel_id)
                || channel_name.is_some_and(|name| entry.eq_ignore_ascii_case(name))
        };

        if self.excluded_channels.iter().any(matches) {
            return false;
        }
        self.monitored_channels.is_empty() || self.monitored_channels.iter().any(matches)
    }
}
