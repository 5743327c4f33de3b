//! Moderation decision core.
//!
//! Every message is scored twice:
//! 1. `BaselineClassifier`: per-category harm severities
//! 2. `ContextualJudge`: LLM opinion with author/channel context
//!
//! `DecisionEngine` merges both with the live policy table into a `Verdict`.

pub mod baseline;
pub mod decision;
pub mod judge;
pub mod types;

pub use baseline::{BaselineClassifier, ContentSafetyClassifier, ContentSafetyConfig};
pub use decision::{DecisionEngine, decide, normalize_category};
pub use judge::{ContextualJudge, JudgeContext, LlmJudge, parse_judgment};
pub use types::{
    BaselineScore, InboundMessage, Judgment, PolicyAction, SafetyCategory, Severity, Verdict,
};
