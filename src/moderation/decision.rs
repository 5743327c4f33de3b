//! Decision engine: merges baseline scores and the judge's opinion with the
//! policy table into a single verdict.
//!
//! The merge is pure and deterministic:
//! 1. A message is a violation when the judge says so or any baseline
//!    category reaches its flagging threshold.
//! 2. Violated categories are the judge's categories in order, followed by
//!    flagged baseline categories, deduplicated by normalized name.
//! 3. Each category is looked up in the policy table. Enabled rules
//!    contribute their action (the strictest wins) and their notify flag
//!    (any one is enough).
//!
//! A violation whose categories match no enabled rule resolves to `allow`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::moderation::types::{BaselineScore, Judgment, PolicyAction, Severity, Verdict};
use crate::policy::model::PolicyTable;
use crate::policy::store::PolicyStore;

/// Confidence reported when the judge did not give one.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Normalize a category name for policy lookup: trimmed, lowercase, spaces
/// and hyphens replaced by underscores.
///
/// Trimming and the hyphen mapping go beyond plain lowercase-and-underscore
/// matching on purpose. Judges write `PII-leak` or ` hate speech` as often as
/// `pii_leak`, and those must hit the same rule. Policy keys are normalized
/// the same way when a table is built, so the wider mapping cannot split one
/// rule into two.
pub fn normalize_category(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Compute a verdict from the two classifier signals and a policy table.
pub fn decide(baseline: &BaselineScore, judgment: &Judgment, policy: &PolicyTable) -> Verdict {
    let severity = judgment.severity.unwrap_or(Severity::Low);
    let confidence = judgment
        .confidence
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);

    let is_violation = judgment.is_violation || baseline.is_flagged();
    if !is_violation {
        return Verdict {
            severity,
            confidence,
            recommended_action: judgment.recommended_action,
            ..Verdict::allow(*baseline, judgment.justification.clone())
        };
    }

    let violated_categories = violated_categories(baseline, judgment);

    let mut action = PolicyAction::Allow;
    let mut notify = false;
    for category in &violated_categories {
        if let Some(rule) = policy.rule(category).filter(|r| r.enabled) {
            action = action.max(rule.action);
            notify |= rule.notify;
        }
    }

    Verdict {
        is_violation,
        violated_categories,
        severity,
        confidence,
        action,
        notify,
        justification: judgment.justification.clone(),
        recommended_action: judgment.recommended_action,
        baseline: *baseline,
    }
}

/// Judge categories first, then flagged baseline categories, without repeats.
fn violated_categories(baseline: &BaselineScore, judgment: &Judgment) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut categories = Vec::new();

    let judged = judgment.violations.iter().map(|v| v.trim().to_string());
    let flagged = baseline
        .flagged()
        .into_iter()
        .map(|c| c.as_str().to_string());

    for name in judged.chain(flagged) {
        if name.is_empty() {
            continue;
        }
        if seen.insert(normalize_category(&name)) {
            categories.push(name);
        }
    }
    categories
}

/// Decision engine bound to the live policy store.
///
/// Each evaluation reads one snapshot, so a concurrent replace never mixes
/// two policy versions within a single verdict.
#[derive(Clone)]
pub struct DecisionEngine {
    store: Arc<PolicyStore>,
}

impl DecisionEngine {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn evaluate(&self, baseline: &BaselineScore, judgment: &Judgment) -> Verdict {
        let snapshot = self.store.current_snapshot();
        decide(baseline, judgment, &snapshot.policies)
    }
}
