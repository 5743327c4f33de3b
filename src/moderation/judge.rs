//! Contextual judge: LLM-backed policy assessment and notification drafting.
//!
//! The judge sees the message text, who posted it and where, plus the
//! baseline scores, and answers with a JSON object. Answers that cannot be
//! interpreted become a non-violation with zero confidence; transport
//! failures are returned as errors so the pipeline can retry them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::moderation::types::{BaselineScore, Judgment, PolicyAction, Severity};
use crate::notify::{NotificationDraft, ViolationSummary};

/// Max tokens for the judgment call.
const JUDGE_MAX_TOKENS: u32 = 512;

/// Max tokens for the notification drafting call.
const COMPOSE_MAX_TOKENS: u32 = 800;

/// Low temperature keeps verdicts stable across retries.
const JUDGE_TEMPERATURE: f32 = 0.0;

const COMPOSE_TEMPERATURE: f32 = 0.3;

/// Longest message excerpt sent to the model.
const MAX_PROMPT_CHARS: usize = 4000;

/// Who posted the message and where.
#[derive(Debug, Clone, Default)]
pub struct JudgeContext {
    pub author: String,
    pub channel: String,
}

/// Second-opinion classifier with workplace context.
#[async_trait]
pub trait ContextualJudge: Send + Sync {
    /// Assess one message. Unparseable model output yields
    /// [`Judgment::safe_default`]; only transport failures are errors.
    async fn judge(
        &self,
        text: &str,
        context: &JudgeContext,
        baseline: &BaselineScore,
    ) -> Result<Judgment, LlmError>;

    /// Draft an alert for reviewers.
    async fn compose_notification(
        &self,
        summary: &ViolationSummary,
    ) -> Result<NotificationDraft, LlmError>;
}

/// `ContextualJudge` backed by an `LlmProvider`.
pub struct LlmJudge {
    llm: Arc<dyn LlmProvider>,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ContextualJudge for LlmJudge {
    async fn judge(
        &self,
        text: &str,
        context: &JudgeContext,
        baseline: &BaselineScore,
    ) -> Result<Judgment, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_judge_system_prompt()),
            ChatMessage::user(build_judge_user_prompt(text, context, baseline)),
        ])
        .with_temperature(JUDGE_TEMPERATURE)
        .with_max_tokens(JUDGE_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let judgment = parse_judgment(&response.content);
        debug!(
            model = self.llm.model_name(),
            is_violation = judgment.is_violation,
            violations = ?judgment.violations,
            "Judgment received"
        );
        Ok(judgment)
    }

    async fn compose_notification(
        &self,
        summary: &ViolationSummary,
    ) -> Result<NotificationDraft, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_compose_system_prompt()),
            ChatMessage::user(build_compose_user_prompt(summary)),
        ])
        .with_temperature(COMPOSE_TEMPERATURE)
        .with_max_tokens(COMPOSE_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        parse_notification_draft(&response.content).map_err(|reason| {
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_judge_system_prompt() -> String {
    "You are a content moderation expert reviewing workplace chat messages.\n\n\
     Check each message for:\n\
     1. Hate speech, discrimination or harassment (hate_speech)\n\
     2. Profane or offensive language (profanity)\n\
     3. Violent or threatening content (violence)\n\
     4. Self-harm related content (self_harm)\n\
     5. Sexually explicit content (sexual_content)\n\
     6. Leaked personal or confidential information (pii_leak)\n\n\
     For each message:\n\
     - Decide whether it violates any policy\n\
     - List the violated policies by the names above\n\
     - Rate severity as low, medium or high\n\
     - Give a short justification\n\
     - Consider workplace context and avoid false positives on technical jargon \
     or legitimate business discussion\n\n\
     Respond with ONLY a JSON object:\n\
     {\"is_violation\": true, \"violations\": [\"...\"], \"severity\": \"low|medium|high\", \
     \"confidence\": 0.0, \"justification\": \"...\", \"recommended_action\": \"delete|flag|archive|allow\"}"
        .to_string()
}

fn build_judge_user_prompt(text: &str, context: &JudgeContext, baseline: &BaselineScore) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str("Analyze this chat message for policy violations.\n\n");

    let excerpt: String = text.chars().take(MAX_PROMPT_CHARS).collect();
    prompt.push_str(&format!("Message: \"{}\"\n", excerpt));

    let author = non_empty_or(&context.author, "Unknown");
    let channel = non_empty_or(&context.channel, "Unknown");
    prompt.push_str(&format!("Context: posted by {author} in #{channel}.\n"));

    let scores: Vec<String> = baseline
        .iter()
        .map(|(category, severity)| format!("{category}={severity}"))
        .collect();
    prompt.push_str(&format!(
        "Baseline classifier severities (0-6): {}\n",
        scores.join(", ")
    ));

    prompt
}

fn build_compose_system_prompt() -> String {
    "You write alerts for the HR team when chat messages break workplace policy.\n\n\
     Each alert includes:\n\
     1. A subject line that signals urgency\n\
     2. Which policies were broken\n\
     3. The provided message excerpt, never more than that\n\
     4. Who posted it, when, and in which channel\n\
     5. The action already taken\n\
     6. Recommended follow-up for HR\n\n\
     Be professional and factual. Keep it concise.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"subject\": \"...\", \"body\": \"...\", \"urgency\": \"high|medium|low\", \
     \"recommended_actions\": [\"...\"]}"
        .to_string()
}

fn build_compose_user_prompt(summary: &ViolationSummary) -> String {
    format!(
        "Compose a notification for this policy violation.\n\n\
         Violation details:\n\
         - Policies violated: {}\n\
         - Severity: {}\n\
         - Action taken: {}\n\
         - Justification: {}\n\n\
         Context:\n\
         - Author: {}\n\
         - Channel: {}\n\
         - Timestamp: {}\n\
         - Message excerpt: \"{}\"",
        summary.violations.join(", "),
        summary.severity,
        summary.action_taken,
        summary.justification,
        summary.author,
        summary.channel,
        summary.timestamp.to_rfc3339(),
        summary.excerpt,
    )
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Interpret the judge's reply. Never fails: anything unusable becomes the
/// safe default.
pub fn parse_judgment(raw: &str) -> Judgment {
    let json_str = extract_json_object(raw);
    let value: Value = match serde_json::from_str(&json_str) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Judge reply is not JSON, treating as non-violation");
            return Judgment::safe_default(format!("unparseable judge reply: {e}"));
        }
    };

    let Some(is_violation) = field(&value, "is_violation", "isViolation").and_then(Value::as_bool)
    else {
        warn!("Judge reply lacks is_violation, treating as non-violation");
        return Judgment::safe_default("judge reply missing is_violation");
    };

    let violations = match field(&value, "violations", "violations") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(single)) if !single.trim().is_empty() => vec![single.trim().to_string()],
        _ => Vec::new(),
    };

    let severity = field(&value, "severity", "severity")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Severity>().ok());

    let confidence = field(&value, "confidence", "confidence")
        .and_then(Value::as_f64)
        .map(|c| (c as f32).clamp(0.0, 1.0));

    let justification = field(&value, "justification", "justification")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let recommended_action = field(&value, "recommended_action", "recommendedAction")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<PolicyAction>().ok());

    Judgment {
        is_violation,
        violations,
        severity,
        confidence,
        justification,
        recommended_action,
    }
}

/// Interpret a drafted notification. Subject and body are required.
pub fn parse_notification_draft(raw: &str) -> Result<NotificationDraft, String> {
    let json_str = extract_json_object(raw);
    let value: Value =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let subject = text("subject").ok_or("draft missing subject")?;
    let body = text("body").ok_or("draft missing body")?;
    let urgency = text("urgency").and_then(|u| u.parse::<Severity>().ok());
    let recommended_actions = value
        .get("recommended_actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(NotificationDraft {
        subject,
        body,
        urgency,
        recommended_actions,
    })
}

fn field<'a>(value: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    value.get(snake).or_else(|| value.get(camel))
}

/// Extract a JSON object from LLM output (handles markdown wrapping and
/// surrounding prose).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::llm::provider::{CompletionResponse, FinishReason};

    /// Mock LLM that returns a canned reply and records the prompts it saw.
    struct MockJudgeLlm {
        response: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockJudgeLlm {
        fn replying(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockJudgeLlm {
        fn model_name(&self) -> &str {
            "mock-judge"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            if let Some(last) = request.messages.last() {
                self.prompts.lock().unwrap().push(last.content.clone());
            }
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "connection reset".into(),
                }),
            }
        }
    }

    // ── Prompt construction tests ───────────────────────────────────

    #[test]
    fn judge_system_prompt_names_policies_and_format() {
        let prompt = build_judge_system_prompt();
        assert!(prompt.contains("hate_speech"));
        assert!(prompt.contains("pii_leak"));
        assert!(prompt.contains("is_violation"));
        assert!(prompt.contains("recommended_action"));
    }

    #[test]
    fn judge_user_prompt_includes_context_and_baseline() {
        let baseline = BaselineScore {
            hate: 2,
            ..Default::default()
        };
        let context = JudgeContext {
            author: "Dana".into(),
            channel: "General".into(),
        };
        let prompt = build_judge_user_prompt("you are all idiots", &context, &baseline);
        assert!(prompt.contains("you are all idiots"));
        assert!(prompt.contains("posted by Dana in #General"));
        assert!(prompt.contains("hate=2"));
        assert!(prompt.contains("violence=0"));
    }

    #[test]
    fn judge_user_prompt_defaults_unknown_context() {
        let prompt =
            build_judge_user_prompt("hi", &JudgeContext::default(), &BaselineScore::default());
        assert!(prompt.contains("posted by Unknown in #Unknown"));
    }

    #[test]
    fn judge_user_prompt_truncates_content() {
        let long = "x".repeat(10_000);
        let prompt =
            build_judge_user_prompt(&long, &JudgeContext::default(), &BaselineScore::default());
        assert!(prompt.len() < MAX_PROMPT_CHARS + 400);
    }

    #[test]
    fn compose_prompt_carries_summary() {
        let summary = ViolationSummary {
            violations: vec!["hate_speech".into()],
            severity: Severity::High,
            action_taken: "deleted".into(),
            justification: "slur".into(),
            author: "Dana".into(),
            channel: "General".into(),
            timestamp: Utc::now(),
            excerpt: "[Content redacted due to severe violation]".into(),
        };
        let prompt = build_compose_user_prompt(&summary);
        assert!(prompt.contains("hate_speech"));
        assert!(prompt.contains("Severity: high"));
        assert!(prompt.contains("Action taken: deleted"));
        assert!(prompt.contains("[Content redacted due to severe violation]"));
    }

    // ── Judgment parsing tests ──────────────────────────────────────

    #[test]
    fn parse_full_judgment() {
        let raw = r#"{"is_violation": true, "violations": ["hate_speech"], "severity": "high",
            "confidence": 0.92, "justification": "slur", "recommended_action": "delete"}"#;
        let judgment = parse_judgment(raw);
        assert!(judgment.is_violation);
        assert_eq!(judgment.violations, vec!["hate_speech"]);
        assert_eq!(judgment.severity, Some(Severity::High));
        assert!((judgment.confidence.unwrap() - 0.92).abs() < 0.001);
        assert_eq!(judgment.recommended_action, Some(PolicyAction::Delete));
    }

    #[test]
    fn parse_fenced_judgment() {
        let raw = "Here is my analysis:\n```json\n{\"is_violation\": false, \"violations\": []}\n```";
        let judgment = parse_judgment(raw);
        assert!(!judgment.is_violation);
        assert!(judgment.severity.is_none());
        assert!(judgment.confidence.is_none());
    }

    #[test]
    fn parse_judgment_with_surrounding_prose() {
        let raw = "Assessment: {\"is_violation\": true, \"violations\": [\"profanity\"]} done.";
        let judgment = parse_judgment(raw);
        assert!(judgment.is_violation);
        assert_eq!(judgment.violations, vec!["profanity"]);
    }

    #[test]
    fn parse_camel_case_fields() {
        let raw = r#"{"isViolation": true, "violations": "pii_leak", "recommendedAction": "flag"}"#;
        let judgment = parse_judgment(raw);
        assert!(judgment.is_violation);
        assert_eq!(judgment.violations, vec!["pii_leak"]);
        assert_eq!(judgment.recommended_action, Some(PolicyAction::Flag));
    }

    #[test]
    fn malformed_reply_is_safe_default() {
        let judgment = parse_judgment("I cannot help with that.");
        assert!(!judgment.is_violation);
        assert_eq!(judgment.confidence, Some(0.0));
        assert!(judgment.violations.is_empty());
    }

    #[test]
    fn missing_is_violation_is_safe_default() {
        let judgment = parse_judgment(r#"{"violations": ["hate_speech"], "severity": "high"}"#);
        assert!(!judgment.is_violation);
        assert!(judgment.violations.is_empty());
    }

    #[test]
    fn invalid_enums_and_out_of_range_confidence() {
        let raw = r#"{"is_violation": true, "severity": "catastrophic", "confidence": 7,
            "recommended_action": "ban"}"#;
        let judgment = parse_judgment(raw);
        assert!(judgment.severity.is_none());
        assert_eq!(judgment.confidence, Some(1.0));
        assert!(judgment.recommended_action.is_none());
    }

    #[test]
    fn parse_draft_requires_subject_and_body() {
        let draft = parse_notification_draft(
            r#"{"subject": "Alert", "body": "Details", "urgency": "high", "recommended_actions": ["Review"]}"#,
        )
        .unwrap();
        assert_eq!(draft.subject, "Alert");
        assert_eq!(draft.urgency, Some(Severity::High));
        assert_eq!(draft.recommended_actions, vec!["Review"]);

        assert!(parse_notification_draft(r#"{"subject": "Alert"}"#).is_err());
        assert!(parse_notification_draft("not json").is_err());
    }

    // ── JSON extraction tests ───────────────────────────────────────

    #[test]
    fn extract_plain_object() {
        assert_eq!(extract_json_object("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn extract_bare_fence() {
        assert_eq!(extract_json_object("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    // ── Adapter tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn llm_judge_parses_model_reply() {
        let llm = Arc::new(MockJudgeLlm::replying(
            r#"{"is_violation": true, "violations": ["violence"], "severity": "medium", "confidence": 0.7}"#,
        ));
        let judge = LlmJudge::new(llm.clone());
        let context = JudgeContext {
            author: "Sam".into(),
            channel: "ops".into(),
        };

        let judgment = judge
            .judge("I'll break your keyboard", &context, &BaselineScore::default())
            .await
            .unwrap();
        assert!(judgment.is_violation);
        assert_eq!(judgment.violations, vec!["violence"]);
        assert!(llm.prompts.lock().unwrap()[0].contains("break your keyboard"));
    }

    #[tokio::test]
    async fn llm_judge_surfaces_transport_errors() {
        let judge = LlmJudge::new(Arc::new(MockJudgeLlm::failing()));
        let result = judge
            .judge("hello", &JudgeContext::default(), &BaselineScore::default())
            .await;
        assert!(matches!(result, Err(ref e) if e.is_transient()));
    }

    #[tokio::test]
    async fn llm_judge_garbage_reply_is_not_an_error() {
        let judge = LlmJudge::new(Arc::new(MockJudgeLlm::replying("¯\\_(ツ)_/¯")));
        let judgment = judge
            .judge("hello", &JudgeContext::default(), &BaselineScore::default())
            .await
            .unwrap();
        assert!(!judgment.is_violation);
    }

    #[tokio::test]
    async fn compose_rejects_unusable_draft() {
        let judge = LlmJudge::new(Arc::new(MockJudgeLlm::replying("{}")));
        let summary = ViolationSummary {
            violations: vec![],
            severity: Severity::Low,
            action_taken: "flagged".into(),
            justification: String::new(),
            author: "a".into(),
            channel: "c".into(),
            timestamp: Utc::now(),
            excerpt: "x".into(),
        };
        let result = judge.compose_notification(&summary).await;
        assert!(matches!(result, Err(LlmError::InvalidResponse { .. })));
    }
}
