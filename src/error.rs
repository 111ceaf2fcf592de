use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketContextError {
    #[error("Invalid period format '{0}': expected YYYY-QN with N between 1 and 4")]
    InvalidPeriod(String),

    #[error("Snapshot error for {period}: {details}")]
    Snapshot { period: String, details: String },

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Model API error (status {status}): {body}")]
    ApiStatus { status: u16, body: String },

    #[error("Model API transport error: {0}")]
    Transport(String),

    #[error("Model call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Model call failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Rate limiter is closed")]
    RateLimiterClosed,

    #[error("Invalid configuration for {key}: {details}")]
    Config { key: String, details: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MarketContextError {
    /// Failures worth another attempt at the call layer: timeouts, dropped
    /// connections, throttling and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::ApiStatus { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

#[cfg(feature = "openai")]
impl From<reqwest::Error> for MarketContextError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::ApiStatus {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, MarketContextError>;

/// Classification of what went wrong in a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retrieval failed; the run continued without document context.
    RetrievalDegraded,
    ParseFailure,
    SchemaViolation,
    NumericMismatch,
    DenylistViolation,
    RevisionBudgetExhausted,
    /// A model call or the snapshot source failed after call-level retries.
    ExternalFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::RetrievalDegraded => "retrieval_degraded",
            FailureKind::ParseFailure => "parse_failure",
            FailureKind::SchemaViolation => "schema_violation",
            FailureKind::NumericMismatch => "numeric_mismatch",
            FailureKind::DenylistViolation => "denylist_violation",
            FailureKind::RevisionBudgetExhausted => "revision_budget_exhausted",
            FailureKind::ExternalFailure => "external_failure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MarketContextError::Timeout(60).is_retryable());
        assert!(MarketContextError::Transport("reset".into()).is_retryable());
        assert!(MarketContextError::ApiStatus {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(MarketContextError::ApiStatus {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!MarketContextError::ApiStatus {
            status: 401,
            body: String::new()
        }
        .is_retryable());
        assert!(!MarketContextError::Retrieval("index offline".into()).is_retryable());
    }

    #[test]
    fn test_failure_kind_names_match_serde() {
        let kind = FailureKind::RevisionBudgetExhausted;
        assert_eq!(
            serde_json::to_value(kind).unwrap(),
            serde_json::json!(kind.to_string())
        );
    }
}
