//! Error types for the reelflow orchestrator.
//!
//! Every failure a run can end with is represented here, so that the
//! orchestrator can persist a short human-readable message and callers can
//! match on the outcome instead of parsing strings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::store::{RunId, ScopeKey};

/// The main error type for reelflow operations.
#[derive(Debug, Error)]
pub enum ReelflowError {
    /// A stage name could not be resolved.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// Another run already owns the requested scope.
    #[error("{0}")]
    AdmissionConflict(#[from] AdmissionConflictError),

    /// An outbound call failed after exhausting retries.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// A collaborator produced structured output that could not be repaired.
    #[error("{0}")]
    Repair(#[from] RepairError),

    /// The checkpoint confirmation never arrived.
    #[error("Timed out waiting for confirmation after stage '{stage}'")]
    CheckpointTimeout {
        /// The stage whose checkpoint expired.
        stage: String,
    },

    /// Feedback re-routed the run more often than allowed.
    #[error("Too many revisions: run was re-planned more than {limit} times")]
    TooManyRevisions {
        /// The configured re-plan limit.
        limit: usize,
    },

    /// The run was cancelled cooperatively.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A stage executor failed.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// The failing stage.
        stage: String,
        /// The collaborator's error.
        #[source]
        source: anyhow::Error,
    },

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is malformed or not allowed in the current state.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A wait exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ReelflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ReelflowError {
    /// Wraps a collaborator error raised while running `stage`.
    pub fn stage(stage: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Returns true if this error represents cancellation rather than failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the message stored on a failed run, truncated to `limit` characters.
    #[must_use]
    pub fn user_message(&self, limit: usize) -> String {
        truncate_message(&self.to_string(), limit)
    }
}

/// Truncates `message` to at most `limit` characters, appending an ellipsis.
#[must_use]
pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message.to_string();
    }
    let mut out: String = message.chars().take(limit.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Error raised when a stage name is not part of the fixed stage list.
#[derive(Debug, Clone, Error)]
#[error("Unknown stage: '{name}'{}", describe_detail(.detail))]
pub struct UnknownStageError {
    /// The offending name.
    pub name: String,
    /// Why the name was rejected, when it is known but not allowed.
    pub detail: Option<String>,
}

impl UnknownStageError {
    /// Creates a new unknown stage error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detail: None,
        }
    }

    /// Sets the rejection detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn describe_detail(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Error raised when admission finds a live run for an overlapping scope.
#[derive(Debug, Clone, Error)]
#[error("Another run ({active_run}) is already in progress for {scope}")]
pub struct AdmissionConflictError {
    /// The requested scope.
    pub scope: ScopeKey,
    /// The run currently holding the scope.
    pub active_run: RunId,
}

impl AdmissionConflictError {
    /// Creates a new admission conflict error.
    #[must_use]
    pub fn new(scope: ScopeKey, active_run: RunId) -> Self {
        Self { scope, active_run }
    }
}

/// A classified outbound-call failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    /// The request timed out.
    #[error("Request timed out")]
    Timeout,
    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),
    /// The remote answered with a non-success status.
    #[error("HTTP {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body excerpt.
        body: String,
    },
    /// Any other failure; never retried.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Creates a status error.
    #[must_use]
    pub fn status(code: u16, body: impl Into<String>) -> Self {
        Self::Status {
            code,
            body: body.into(),
        }
    }

    /// Returns the status code, if the failure carried one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the failure is transient under `retry_status_codes`.
    #[must_use]
    pub fn is_retryable(&self, retry_status_codes: &[u16]) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { code, .. } => retry_status_codes.contains(code),
            Self::Other(_) => false,
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::status(status.as_u16(), err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Network(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Error raised when every repair strategy failed to produce a JSON object.
#[derive(Debug, Clone, Error)]
#[error("Could not parse structured output: {reason} (input: {excerpt})")]
pub struct RepairError {
    /// What went wrong.
    pub reason: String,
    /// The first characters of the offending text.
    pub excerpt: String,
    /// The strategies that were attempted, in order.
    pub attempted: Vec<String>,
}

impl RepairError {
    /// Creates a new repair error, keeping a short excerpt of `input`.
    #[must_use]
    pub fn new(reason: impl Into<String>, input: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: truncate_message(input, 200),
            attempted: Vec::new(),
        }
    }

    /// Records the attempted strategies.
    #[must_use]
    pub fn with_attempted(mut self, attempted: Vec<String>) -> Self {
        self.attempted = attempted;
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("reason".to_string(), serde_json::json!(self.reason));
        map.insert("excerpt".to_string(), serde_json::json!(self.excerpt));
        map.insert("attempted".to_string(), serde_json::json!(self.attempted));
        map
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = ReelflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

    #[test]
    fn test_transport_retryable_classification() {
        assert!(TransportError::Timeout.is_retryable(&RETRY_CODES));
        assert!(TransportError::Network("reset".into()).is_retryable(&RETRY_CODES));
        assert!(TransportError::status(429, "slow down").is_retryable(&RETRY_CODES));
        assert!(TransportError::status(503, "").is_retryable(&RETRY_CODES));
        assert!(!TransportError::status(400, "bad").is_retryable(&RETRY_CODES));
        assert!(!TransportError::status(401, "auth").is_retryable(&RETRY_CODES));
        assert!(!TransportError::Other("boom".into()).is_retryable(&RETRY_CODES));
    }

    #[test]
    fn test_user_message_truncated() {
        let err = ReelflowError::Store("x".repeat(1000));
        let msg = err.user_message(50);
        assert_eq!(msg.chars().count(), 50);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_user_message_short_untouched() {
        let err = ReelflowError::CheckpointTimeout {
            stage: "director".into(),
        };
        assert_eq!(
            err.user_message(500),
            "Timed out waiting for confirmation after stage 'director'"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(ReelflowError::Cancelled("user".into()).is_cancellation());
        assert!(!ReelflowError::TooManyRevisions { limit: 3 }.is_cancellation());
    }

    #[test]
    fn test_stage_error_wraps_source() {
        let err = ReelflowError::stage("scriptwriter", anyhow::anyhow!("model refused"));
        assert_eq!(err.to_string(), "Stage 'scriptwriter' failed: model refused");
    }

    #[test]
    fn test_unknown_stage_message_includes_detail() {
        let err = UnknownStageError::new("review").with_detail("not a re-plan target");
        assert_eq!(err.to_string(), "Unknown stage: 'review' (not a re-plan target)");
        assert_eq!(UnknownStageError::new("x").to_string(), "Unknown stage: 'x'");
    }

    #[test]
    fn test_repair_error_excerpt() {
        let err = RepairError::new("no object", &"y".repeat(400))
            .with_attempted(vec!["strip_code_fence".into()]);
        assert_eq!(err.excerpt.chars().count(), 200);
        assert_eq!(err.to_dict()["attempted"], serde_json::json!(["strip_code_fence"]));
    }
}
