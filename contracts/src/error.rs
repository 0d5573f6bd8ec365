//! Error taxonomy surfaced by the routing fabric
//!
//! Every variant carries a stable `code()` tag that the HTTP layer maps to
//! a status code and that metrics use as the outcome label.

use crate::profile::EfficiencyMode;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// Every backend was filtered out of the candidate set
    #[error("no candidate backend: {reason}")]
    NoCandidate { reason: String },

    /// The caller's explicit target is excluded by the active profile
    #[error("target '{target}' disallowed by {mode} mode: {suggestion}")]
    ProfileDisallowedTarget {
        target: String,
        mode: EfficiencyMode,
        suggestion: String,
    },

    /// 5xx, timeout, connection reset — retryable on another tier
    #[error("backend '{backend_id}' transient failure: {message}")]
    BackendTransient { backend_id: String, message: String },

    /// 4xx (except 429) or malformed response — not retryable
    #[error("backend '{backend_id}' permanent failure: {message}")]
    BackendPermanent { backend_id: String, message: String },

    /// The backend's circuit breaker is open; fast failure path
    #[error("circuit breaker open for backend '{backend_id}'")]
    BreakerOpen { backend_id: String },

    #[error("model '{model}' not supported by any candidate backend")]
    ModelUnsupported { model: String },

    #[error("invalid annotation: {message}")]
    InvalidAnnotation { message: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Caller went away; not counted as a backend failure
    #[error("request cancelled")]
    Cancelled,

    /// Broken internal invariant; the process terminates after a drain
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },
}

impl RouterError {
    /// Stable taxonomy tag for wire bodies, logs, and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::NoCandidate { .. } => "no_candidate",
            RouterError::ProfileDisallowedTarget { .. } => "profile_disallowed_target",
            RouterError::BackendTransient { .. } => "backend_transient",
            RouterError::BackendPermanent { .. } => "backend_permanent",
            RouterError::BreakerOpen { .. } => "breaker_open",
            RouterError::ModelUnsupported { .. } => "model_unsupported",
            RouterError::InvalidAnnotation { .. } => "invalid_annotation",
            RouterError::DeadlineExceeded => "deadline_exceeded",
            RouterError::Cancelled => "cancelled",
            RouterError::InternalInvariant { .. } => "internal_invariant",
        }
    }

    /// Whether the forwarding loop may try the next tier
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::BackendTransient { .. } | RouterError::BreakerOpen { .. }
        )
    }

    /// Whether this error should count against the backend's breaker.
    /// Cancellation and deadline expiry are caller-side conditions.
    pub fn counts_as_backend_failure(&self) -> bool {
        matches!(
            self,
            RouterError::BackendTransient { .. } | RouterError::BackendPermanent { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = RouterError::NoCandidate {
            reason: "thermal".to_string(),
        };
        assert_eq!(err.code(), "no_candidate");
        assert_eq!(RouterError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn cancellation_is_not_a_backend_failure() {
        assert!(!RouterError::Cancelled.counts_as_backend_failure());
        assert!(!RouterError::DeadlineExceeded.counts_as_backend_failure());
        assert!(RouterError::BackendTransient {
            backend_id: "b".to_string(),
            message: "503".to_string()
        }
        .counts_as_backend_failure());
    }

    #[test]
    fn transient_classification() {
        assert!(RouterError::BreakerOpen {
            backend_id: "b".to_string()
        }
        .is_transient());
        assert!(!RouterError::ModelUnsupported {
            model: "m".to_string()
        }
        .is_transient());
    }
}
