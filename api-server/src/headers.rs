//! Routing annotations on the wire
//!
//! Callers pass hints as `X-*` request headers; responses echo the
//! routing outcome the same way.

use axum::http::{HeaderMap, HeaderValue};
use inference_fabric_contracts::{RequestAnnotations, RoutingMetadata};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Parse the `X-*` annotation headers. Malformed numeric values are an
/// error rather than silently ignored hints.
pub fn annotations_from_headers(headers: &HeaderMap) -> Result<RequestAnnotations, String> {
    let mut annotations = RequestAnnotations::default();

    if let Some(target) = header_str(headers, "x-target-backend") {
        annotations.target = Some(target.to_string());
    }
    if let Some(value) = header_str(headers, "x-latency-critical") {
        annotations.latency_critical = parse_bool(value);
    }
    if let Some(value) = header_str(headers, "x-power-efficient") {
        annotations.power_efficient = parse_bool(value);
    }
    if let Some(value) = header_str(headers, "x-max-latency-ms") {
        annotations.max_latency_ms = Some(
            value
                .parse()
                .map_err(|_| format!("X-Max-Latency-Ms: '{}' is not an integer", value))?,
        );
    }
    if let Some(value) = header_str(headers, "x-max-power-watts") {
        annotations.max_power_watts = Some(
            value
                .parse()
                .map_err(|_| format!("X-Max-Power-Watts: '{}' is not a number", value))?,
        );
    }
    if let Some(value) = header_str(headers, "x-priority") {
        annotations.priority = value
            .parse()
            .map_err(|e| format!("X-Priority: {}", e))?;
    }
    if let Some(value) = header_str(headers, "x-request-id") {
        annotations.request_id = Some(value.to_string());
    }
    if let Some(value) = header_str(headers, "x-media-type") {
        annotations.media_type = Some(value.to_string());
    }
    Ok(annotations)
}

/// Echo the routing outcome onto a response
pub fn apply_routing_headers(headers: &mut HeaderMap, routing: &RoutingMetadata) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set(headers, "x-backend-used", routing.backend_used.clone());
    set(
        headers,
        "x-estimated-latency-ms",
        routing.estimated_latency_ms.to_string(),
    );
    set(
        headers,
        "x-estimated-power-w",
        format!("{:.1}", routing.estimated_power_watts),
    );
    set(headers, "x-routing-reason", routing.reason.clone());
    if !routing.alternatives.is_empty() {
        set(
            headers,
            "x-alternatives",
            routing.alternatives.join(","),
        );
    }
}
