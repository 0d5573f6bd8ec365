//! Request and response shapes for the generation service

use crate::decision::RoutingMetadata;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller priority levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPriority {
    BestEffort,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for RequestPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best-effort" | "besteffort" => Ok(RequestPriority::BestEffort),
            "normal" => Ok(RequestPriority::Normal),
            "high" => Ok(RequestPriority::High),
            "critical" => Ok(RequestPriority::Critical),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Per-request routing hints supplied by the caller
///
/// All fields are optional on the wire; absent hints leave the router free
/// to choose. An explicit `target` is a preference, not a command — the
/// active efficiency profile may override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestAnnotations {
    /// Explicit backend id the caller prefers
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub latency_critical: bool,
    #[serde(default)]
    pub power_efficient: bool,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub max_power_watts: Option<f64>,
    #[serde(default)]
    pub priority: RequestPriority,
    /// Media hint, e.g. `realtime` or `audio`
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Overall budget for this request; propagated to downstream calls
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// A single text-generation request as seen by the routing fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub id: Uuid,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub annotations: RequestAnnotations,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            prompt: prompt.into(),
            annotations: RequestAnnotations::default(),
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }

    /// The id echoed back to the caller: their `X-Request-ID` if given,
    /// otherwise the generated uuid.
    pub fn request_id(&self) -> String {
        self.annotations
            .request_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Execution statistics attached to a completed generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationStats {
    pub duration_ms: u64,
    /// Attempts made by the forwarding loop; 1 when no escalation happened
    pub attempts: u32,
    pub time_to_first_token_ms: Option<u64>,
    pub confidence: Option<f64>,
}

/// Completed generation with routing provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens: u32,
    /// Estimated energy spent serving this request, joules
    pub estimated_energy_joules: f64,
    pub routing: RoutingMetadata,
    pub stats: GenerationStats,
}

/// One token-ish chunk of a streamed generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub content: String,
    pub done: bool,
    /// Set on the first chunk only
    pub time_to_first_token_ms: Option<u64>,
}
