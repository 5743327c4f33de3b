//! Error types for the moderation service.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration source {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Configuration document {key} not found")]
    NotFound { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat platform client errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Authentication with {platform} failed: {reason}")]
    AuthFailed { platform: String, reason: String },

    #[error("Request to {platform} failed: {reason}")]
    RequestFailed { platform: String, reason: String },

    #[error("{platform} returned HTTP {status}: {body}")]
    Status {
        platform: String,
        status: u16,
        body: String,
    },

    #[error("{platform} rate limited, retry after {retry_after:?}")]
    RateLimited {
        platform: String,
        retry_after: Option<Duration>,
    },

    #[error("{platform} call timed out after {timeout:?}")]
    Timeout { platform: String, timeout: Duration },

    #[error("Invalid response from {platform}: {reason}")]
    InvalidResponse { platform: String, reason: String },
}

impl PlatformError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => is_transient_status(*status),
            Self::AuthFailed { .. } | Self::InvalidResponse { .. } => false,
        }
    }
}

impl Retryable for PlatformError {
    fn is_transient(&self) -> bool {
        PlatformError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Baseline classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    RequestFailed(String),

    #[error("Classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Classifier rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
}

impl ClassifierError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => is_transient_status(*status),
            Self::InvalidResponse(_) => false,
        }
    }
}

impl Retryable for ClassifierError {
    fn is_transient(&self) -> bool {
        ClassifierError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => is_transient_status(*status),
            Self::InvalidResponse { .. } | Self::AuthFailed { .. } | Self::Json(_) => false,
        }
    }
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Notification delivery errors, one per channel attempt.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Channel {channel} delivery failed: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Channel {channel} returned HTTP {status}")]
    Status { channel: String, status: u16 },

    #[error("Channel {channel} timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },

    #[error("Channel {channel} misconfigured: {reason}")]
    Misconfigured { channel: String, reason: String },
}

/// Queue source errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue receive failed: {0}")]
    Receive(String),

    #[error("Queue acknowledge failed for {id}: {reason}")]
    Ack { id: String, reason: String },

    #[error("Dead-letter failed for {id}: {reason}")]
    DeadLetter { id: String, reason: String },

    #[error("Queue full")]
    Full,

    #[error("Queue closed")]
    Closed,
}

/// Per-message pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification failed: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Judgment failed: {0}")]
    Judge(#[from] LlmError),

    #[error("Message resolution failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("Poison message {id}: {reason}")]
    Poison { id: String, reason: String },
}

impl PipelineError {
    /// Whether the failure came from an external dependency that may recover.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Classifier(e) => e.is_transient(),
            Self::Judge(e) => e.is_transient(),
            Self::Platform(e) => e.is_transient(),
            Self::Poison { .. } => false,
        }
    }
}

/// Failure shape the retry loop understands.
pub trait Retryable: std::fmt::Display {
    /// Whether retrying the same call may succeed.
    fn is_transient(&self) -> bool;

    /// Wait requested by the upstream service, if it sent one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// HTTP statuses worth retrying: request timeout, throttling, server faults.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(503));
        assert!(is_transient_status(408));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(401));
        assert!(!is_transient_status(404));
    }

    #[test]
    fn llm_errors_split_transient_and_permanent() {
        let rate_limited = LlmError::RateLimited {
            provider: "azure".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(rate_limited.is_transient());

        let auth = LlmError::AuthFailed {
            provider: "azure".into(),
        };
        assert!(!auth.is_transient());
    }

    #[test]
    fn rate_limits_expose_their_retry_hint() {
        let platform = PlatformError::RateLimited {
            platform: "graph".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            Retryable::retry_after(&platform),
            Some(Duration::from_secs(3))
        );

        let classifier = ClassifierError::RateLimited { retry_after: None };
        assert!(Retryable::is_transient(&classifier));
        assert_eq!(Retryable::retry_after(&classifier), None);

        let timeout = ClassifierError::Timeout(Duration::from_secs(1));
        assert_eq!(Retryable::retry_after(&timeout), None);
    }

    #[test]
    fn pipeline_error_inherits_transience() {
        let err = PipelineError::from(ClassifierError::Status {
            status: 502,
            body: "bad gateway".into(),
        });
        assert!(err.is_transient());

        let poison = PipelineError::Poison {
            id: "m1".into(),
            reason: "undecodable".into(),
        };
        assert!(!poison.is_transient());
    }
}
