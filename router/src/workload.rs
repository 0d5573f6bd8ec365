//! Workload intent detection

use inference_fabric_contracts::{RequestAnnotations, RequestPriority};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkloadClass {
    Realtime,
    Interactive,
    Batch,
    Embeddings,
}

/// Classify a request's workload from its annotations and model.
/// Deterministic and pure; first matching rule wins.
pub fn detect_workload(annotations: &RequestAnnotations, model: &str) -> WorkloadClass {
    let realtime_media = annotations
        .media_type
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case("realtime"))
        .unwrap_or(false);
    let critical_tight_deadline = annotations.priority == RequestPriority::Critical
        && annotations.max_latency_ms.map(|ms| ms <= 100).unwrap_or(false);
    if realtime_media || critical_tight_deadline {
        return WorkloadClass::Realtime;
    }

    if model.to_lowercase().contains("embed") {
        return WorkloadClass::Embeddings;
    }

    let tight = annotations.max_latency_ms.map(|ms| ms <= 500).unwrap_or(false);
    if tight || annotations.latency_critical {
        return WorkloadClass::Interactive;
    }

    WorkloadClass::Batch
}
