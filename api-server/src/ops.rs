//! Operational and control endpoints

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use inference_fabric_contracts::{EfficiencyMode, RouterError};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// `GET /healthz` — process liveness; 200 whenever we are serving
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "inference-fabric",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /readyz` — 200 only when at least one backend can take traffic
pub async fn readyz(State(state): State<AppState>) -> Response {
    if state.registry.any_routable() {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "no routable backends"})),
        )
            .into_response()
    }
}

/// `GET /metrics` — Prometheus text format
pub async fn metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .refresh(&state.registry, &state.thermal, &state.router);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        state.metrics.render(),
    )
        .into_response()
}

/// `GET /efficiency` — the requested mode and the profile in force
pub async fn get_efficiency(State(state): State<AppState>) -> Json<serde_json::Value> {
    let profile = state.efficiency.active_profile();
    Json(json!({
        "requested_mode": state.efficiency.requested_mode().to_string(),
        "active_profile": profile.as_ref(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetModeBody {
    pub mode: String,
}

/// `POST /efficiency {"mode": …}` — switch modes; unknown modes get the
/// allowed set back
pub async fn set_efficiency(
    State(state): State<AppState>,
    Json(body): Json<SetModeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let mode: EfficiencyMode = body.mode.parse().map_err(|_| {
        let allowed: Vec<String> = EfficiencyMode::all()
            .into_iter()
            .map(|mode| mode.to_string())
            .collect();
        ApiError::bad_request(
            format!(
                "unknown mode '{}', allowed: {}",
                body.mode,
                allowed.join(", ")
            ),
            request_id.clone(),
        )
    })?;

    let profile = state.efficiency.set_mode(mode).await.map_err(|error| {
        ApiError::new(
            RouterError::InternalInvariant {
                message: error.to_string(),
            },
            request_id.clone(),
        )
    })?;
    Ok(Json(json!({
        "requested_mode": mode.to_string(),
        "active_profile": profile.as_ref(),
    })))
}

/// `GET /routing/stats` — decision distribution and live telemetry
pub async fn routing_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let decisions = state.router.decision_counts();
    let snapshot = state.thermal.snapshot();
    let backends: Vec<_> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|entry| {
            let id = entry.descriptor.id.clone();
            let reading = snapshot.reading(&id);
            json!({
                "id": id,
                "hardware": entry.descriptor.hardware,
                "liveness": entry.liveness(),
                "in_flight": entry.in_flight(),
                "queue_depth": entry.queue_depth(),
                "decisions": decisions.get(&entry.descriptor.id).copied().unwrap_or(0),
                "temperature_celsius": reading.map(|r| r.temperature_celsius),
                "fan_percent": reading.map(|r| r.fan_percent),
                "throttling": reading.map(|r| r.throttling),
            })
        })
        .collect();
    Json(json!({"backends": backends}))
}
