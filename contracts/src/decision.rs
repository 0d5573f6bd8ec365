//! Routing decisions and forwarding-attempt records

use serde::{Deserialize, Serialize};

/// Outcome of one routing call
///
/// Returned to the caller, never stored. The chosen backend was routable
/// and inside every active limit at the instant the decision was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub backend_id: String,
    /// Human-readable account of why this backend won
    pub reason: String,
    pub estimated_latency_ms: u64,
    pub estimated_power_watts: f64,
    /// Runner-up backend ids, best first
    pub alternatives: Vec<String>,
    /// True iff the chosen backend differs from the caller's explicit
    /// target or critical-flag preference
    pub override_applied: bool,
    pub override_reason: Option<String>,
    /// The caller's explicit target when it differs from the choice
    pub requested: Option<String>,
}

/// Routing provenance attached to generation responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub backend_used: String,
    pub user_requested: Option<String>,
    pub override_applied: bool,
    pub override_reason: Option<String>,
    pub reason: String,
    pub estimated_latency_ms: u64,
    pub estimated_power_watts: f64,
    pub alternatives: Vec<String>,
}

impl From<&RoutingDecision> for RoutingMetadata {
    fn from(decision: &RoutingDecision) -> Self {
        RoutingMetadata {
            backend_used: decision.backend_id.clone(),
            user_requested: decision.requested.clone(),
            override_applied: decision.override_applied,
            override_reason: decision.override_reason.clone(),
            reason: decision.reason.clone(),
            estimated_latency_ms: decision.estimated_latency_ms,
            estimated_power_watts: decision.estimated_power_watts,
            alternatives: decision.alternatives.clone(),
        }
    }
}

/// One attempt in a forwarding chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    /// 1-based attempt index
    pub attempt: u32,
    pub backend_id: String,
    /// Quality score in [0, 1]; 0 for a failed call
    pub score: f64,
    pub reasons: Vec<String>,
    pub accepted: bool,
}
