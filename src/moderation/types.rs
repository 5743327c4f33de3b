//! Shared types for the moderation decision pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// A chat message fetched from the platform.
///
/// `content` is plain text: platform clients strip markup before handing the
/// message to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id, unique within its channel.
    pub id: String,
    pub channel_id: String,
    /// Display name of the channel, when the source knows it.
    pub channel_name: Option<String>,
    pub author_id: String,
    pub author_display_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Key used for deduplication: message ids are only unique per channel.
    pub fn dedup_key(&self) -> String {
        format!("{}/{}", self.channel_id, self.id)
    }

    /// Channel label for prompts and notifications.
    pub fn channel_label(&self) -> &str {
        self.channel_name.as_deref().unwrap_or(&self.channel_id)
    }
}

// ── Baseline scores ─────────────────────────────────────────────────

/// Harm categories reported by the baseline classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    Hate,
    SelfHarm,
    Sexual,
    Violence,
}

impl SafetyCategory {
    pub const ALL: [SafetyCategory; 4] = [
        SafetyCategory::Hate,
        SafetyCategory::SelfHarm,
        SafetyCategory::Sexual,
        SafetyCategory::Violence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hate => "hate",
            Self::SelfHarm => "self_harm",
            Self::Sexual => "sexual",
            Self::Violence => "violence",
        }
    }

    /// Minimum severity at which this category marks a message as a violation.
    pub fn flag_threshold(&self) -> u8 {
        match self {
            Self::Hate => 1,
            _ => 2,
        }
    }

    /// Parse a category name as reported by the classifier (`Hate`, `SelfHarm`,
    /// `self_harm`, ...). Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "hate" => Some(Self::Hate),
            "selfharm" => Some(Self::SelfHarm),
            "sexual" => Some(Self::Sexual),
            "violence" => Some(Self::Violence),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category severities from the baseline classifier.
///
/// Every known category is always present; missing categories read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineScore {
    pub hate: u8,
    pub self_harm: u8,
    pub sexual: u8,
    pub violence: u8,
}

impl BaselineScore {
    /// Build from `(category name, severity)` pairs, ignoring unknown names.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, u8)>) -> Self {
        let mut score = Self::default();
        for (name, severity) in pairs {
            if let Some(category) = SafetyCategory::from_name(name) {
                score.set(category, severity);
            }
        }
        score
    }

    pub fn get(&self, category: SafetyCategory) -> u8 {
        match category {
            SafetyCategory::Hate => self.hate,
            SafetyCategory::SelfHarm => self.self_harm,
            SafetyCategory::Sexual => self.sexual,
            SafetyCategory::Violence => self.violence,
        }
    }

    pub fn set(&mut self, category: SafetyCategory, severity: u8) {
        match category {
            SafetyCategory::Hate => self.hate = severity,
            SafetyCategory::SelfHarm => self.self_harm = severity,
            SafetyCategory::Sexual => self.sexual = severity,
            SafetyCategory::Violence => self.violence = severity,
        }
    }

    /// Categories in canonical order with their severities.
    pub fn iter(&self) -> impl Iterator<Item = (SafetyCategory, u8)> + '_ {
        SafetyCategory::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    /// Categories at or above their flagging threshold, in canonical order.
    pub fn flagged(&self) -> Vec<SafetyCategory> {
        self.iter()
            .filter(|(c, severity)| *severity >= c.flag_threshold())
            .map(|(c, _)| c)
            .collect()
    }

    pub fn is_flagged(&self) -> bool {
        self.iter().any(|(c, severity)| severity >= c.flag_threshold())
    }

    /// Human label for a severity on the 0/2/4/6 scale.
    pub fn severity_label(severity: u8) -> &'static str {
        match severity {
            0 => "Safe",
            1..=2 => "Low",
            3..=4 => "Medium",
            _ => "High",
        }
    }
}

// ── Judgment ────────────────────────────────────────────────────────

/// Overall severity of a violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Enforcement action, ordered by strictness.
///
/// Variant order is the strictness order: `Allow < Archive < Flag < Delete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    Allow,
    Archive,
    Flag,
    Delete,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Archive => "archive",
            Self::Flag => "flag",
            Self::Delete => "delete",
        }
    }

    /// Strictness rank used when several rules match.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Archive => 1,
            Self::Flag => 2,
            Self::Delete => 3,
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "archive" => Ok(Self::Archive),
            "flag" => Ok(Self::Flag),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Structured output of the contextual judge.
///
/// `severity` and `confidence` are optional because the model may omit them;
/// the decision engine supplies defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub is_violation: bool,
    pub violations: Vec<String>,
    pub severity: Option<Severity>,
    pub confidence: Option<f32>,
    pub justification: String,
    pub recommended_action: Option<PolicyAction>,
}

impl Judgment {
    /// Fallback used when the judge's output cannot be interpreted.
    pub fn safe_default(reason: impl Into<String>) -> Self {
        Self {
            is_violation: false,
            violations: Vec::new(),
            severity: None,
            confidence: Some(0.0),
            justification: reason.into(),
            recommended_action: None,
        }
    }
}

// ── Verdict ─────────────────────────────────────────────────────────

/// Final moderation decision for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_violation: bool,
    pub violated_categories: Vec<String>,
    pub severity: Severity,
    pub confidence: f32,
    pub action: PolicyAction,
    pub notify: bool,
    pub justification: String,
    /// What the judge suggested; informational only.
    pub recommended_action: Option<PolicyAction>,
    pub baseline: BaselineScore,
}

impl Verdict {
    /// Verdict for content that needs no enforcement.
    pub fn allow(baseline: BaselineScore, justification: impl Into<String>) -> Self {
        Self {
            is_violation: false,
            violated_categories: Vec::new(),
            severity: Severity::Low,
            confidence: 0.0,
            action: PolicyAction::Allow,
            notify: false,
            justification: justification.into(),
            recommended_action: None,
            baseline,
        }
    }
}
