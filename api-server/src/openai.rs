//! OpenAI-compatible generation endpoints

use crate::error::ApiError;
use crate::headers::{annotations_from_headers, apply_routing_headers};
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use inference_fabric_contracts::{GenerateRequest, RequestAnnotations, StreamChunk};
use inference_fabric_forwarding::{GenerationOutcome, StreamHandle};
use inference_fabric_pipeline::{PipelineFailure, PipelineRequest};
use inference_fabric_registry::AdapterError;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    pub model: String,
    pub input: EmbeddingInput,
}

fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_request(
    model: String,
    prompt: String,
    annotations: RequestAnnotations,
    stream: bool,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
) -> GenerateRequest {
    GenerateRequest {
        id: Uuid::new_v4(),
        model,
        prompt,
        annotations,
        max_tokens,
        temperature,
        stream,
    }
}

fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, ApiError> {
    let annotations = annotations_from_headers(&headers)
        .map_err(|message| ApiError::bad_request(message, Uuid::new_v4().to_string()))?;
    let request = build_request(
        body.model.clone(),
        flatten_messages(&body.messages),
        annotations,
        body.stream,
        body.max_tokens,
        body.temperature,
    );
    let request_id = request.request_id();

    if body.stream {
        let handle = state
            .service
            .generate_stream(&request)
            .await
            .map_err(|error| ApiError::new(error, request_id.clone()))?;
        return Ok(stream_response(state, handle, request_id, body.model, true));
    }

    let started = Instant::now();
    let outcome = match state.service.generate(&request).await {
        Ok(outcome) => outcome,
        Err(error) => {
            state
                .metrics
                .observe_request("none", error.code(), started.elapsed().as_secs_f64());
            return Err(ApiError::new(error, request_id));
        }
    };
    let GenerationOutcome { response, trace } = outcome;
    let routing = response.routing.clone();
    state.metrics.observe_request(
        &routing.backend_used,
        "success",
        started.elapsed().as_secs_f64(),
    );
    info!(
        request_id = %request_id,
        backend = %routing.backend_used,
        attempts = response.stats.attempts,
        "chat completion served"
    );

    let body = json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": body.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": response.text},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": response.tokens,
            "total_tokens": response.tokens,
        },
        "routing": response.routing,
        "stats": response.stats,
        "estimated_energy_joules": response.estimated_energy_joules,
        "forwarding_trace": trace,
    });
    let mut http_response = Json(body).into_response();
    apply_routing_headers(http_response.headers_mut(), &routing);
    Ok(http_response)
}

/// `POST /v1/completions`
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CompletionBody>,
) -> Result<Response, ApiError> {
    let annotations = annotations_from_headers(&headers)
        .map_err(|message| ApiError::bad_request(message, Uuid::new_v4().to_string()))?;
    let request = build_request(
        body.model.clone(),
        body.prompt.clone(),
        annotations,
        body.stream,
        body.max_tokens,
        body.temperature,
    );
    let request_id = request.request_id();

    if body.stream {
        let handle = state
            .service
            .generate_stream(&request)
            .await
            .map_err(|error| ApiError::new(error, request_id.clone()))?;
        return Ok(stream_response(state, handle, request_id, body.model, false));
    }

    let started = Instant::now();
    let outcome = match state.service.generate(&request).await {
        Ok(outcome) => outcome,
        Err(error) => {
            state
                .metrics
                .observe_request("none", error.code(), started.elapsed().as_secs_f64());
            return Err(ApiError::new(error, request_id));
        }
    };
    let GenerationOutcome { response, .. } = outcome;
    let routing = response.routing.clone();
    state.metrics.observe_request(
        &routing.backend_used,
        "success",
        started.elapsed().as_secs_f64(),
    );

    let body = json!({
        "id": format!("cmpl-{}", request_id),
        "object": "text_completion",
        "created": unix_timestamp(),
        "model": body.model,
        "choices": [{
            "index": 0,
            "text": response.text,
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": response.tokens,
            "total_tokens": response.tokens,
        },
        "routing": response.routing,
        "stats": response.stats,
        "estimated_energy_joules": response.estimated_energy_joules,
    });
    let mut http_response = Json(body).into_response();
    apply_routing_headers(http_response.headers_mut(), &routing);
    Ok(http_response)
}

/// `POST /v1/embeddings`
pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EmbeddingsBody>,
) -> Result<Response, ApiError> {
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let inputs = match body.input {
        EmbeddingInput::One(text) => vec![text],
        EmbeddingInput::Many(texts) => texts,
    };
    if inputs.is_empty() {
        return Err(ApiError::bad_request("input must not be empty", request_id));
    }

    let started = Instant::now();
    let (decision, vectors) = match state.service.embed(&body.model, &inputs).await {
        Ok(result) => result,
        Err(error) => {
            state
                .metrics
                .observe_request("none", error.code(), started.elapsed().as_secs_f64());
            return Err(ApiError::new(error, request_id));
        }
    };
    state.metrics.observe_request(
        &decision.backend_id,
        "success",
        started.elapsed().as_secs_f64(),
    );

    let data: Vec<_> = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            json!({"object": "embedding", "index": index, "embedding": embedding})
        })
        .collect();
    let body = json!({
        "object": "list",
        "data": data,
        "model": body.model,
        "usage": {"prompt_tokens": 0, "total_tokens": 0},
    });
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        "x-backend-used",
        decision.backend_id.parse().unwrap_or_else(|_| {
            axum::http::HeaderValue::from_static("unknown")
        }),
    );
    Ok(response)
}

/// `GET /v1/models` — the pool's models, deduplicated, with the serving
/// backends listed
pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let aggregated = state.service.aggregate_models().await;
    let data: Vec<_> = aggregated
        .into_iter()
        .map(|(model, backends)| {
            json!({
                "id": model,
                "object": "model",
                "owned_by": "inference-fabric",
                "served_by": backends,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// `POST /v1/pipeline` — ordered multi-stage execution
pub async fn pipeline(
    State(state): State<AppState>,
    Json(body): Json<PipelineRequest>,
) -> Response {
    match state.pipeline.execute(body).await {
        Ok(outcome) => Json(json!({
            "output": outcome.output,
            "trace": outcome.trace,
        }))
        .into_response(),
        Err(PipelineFailure {
            failed_stage,
            error,
            trace,
        }) => {
            let status = ApiError::new(error.clone(), Uuid::new_v4().to_string());
            let mut response = Json(json!({
                "error": {
                    "code": error.code(),
                    "message": error.to_string(),
                    "failed_stage": failed_stage,
                },
                "trace": trace,
            }))
            .into_response();
            *response.status_mut() = status.into_response().status();
            response
        }
    }
}

/// Shared SSE plumbing: chat deltas or completion text chunks, then a
/// terminal `[DONE]`.
fn stream_response(
    state: AppState,
    handle: StreamHandle,
    request_id: String,
    model: String,
    chat_format: bool,
) -> Response {
    let decision = handle.decision.clone();
    let routing = inference_fabric_contracts::RoutingMetadata::from(&decision);
    state
        .metrics
        .observe_request(&decision.backend_id, "stream", 0.0);

    let created = unix_timestamp();
    let stream = sse_stream(handle, request_id, model, created, chat_format);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    apply_routing_headers(response.headers_mut(), &routing);
    response
}

fn sse_stream(
    handle: StreamHandle,
    request_id: String,
    model: String,
    created: i64,
    chat_format: bool,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    // The handle moves through the unfold state so the in-flight slot is
    // held until the stream finishes or the client disconnects.
    futures::stream::unfold(Some(handle), move |state| {
        let request_id = request_id.clone();
        let model = model.clone();
        async move {
            let mut handle = state?;
            match handle.chunks.recv().await {
                Some(Ok(StreamChunk { done: true, .. })) | None => {
                    Some((Ok(Event::default().data("[DONE]")), None))
                }
                Some(Ok(chunk)) => {
                    let payload = if chat_format {
                        json!({
                            "id": format!("chatcmpl-{}", request_id),
                            "object": "chat.completion.chunk",
                            "created": created,
                            "model": model,
                            "choices": [{
                                "index": 0,
                                "delta": {"content": chunk.content},
                                "finish_reason": null,
                            }],
                            "time_to_first_token_ms": chunk.time_to_first_token_ms,
                        })
                    } else {
                        json!({
                            "id": format!("cmpl-{}", request_id),
                            "object": "text_completion",
                            "created": created,
                            "model": model,
                            "choices": [{"index": 0, "text": chunk.content}],
                            "time_to_first_token_ms": chunk.time_to_first_token_ms,
                        })
                    };
                    Some((
                        Ok(Event::default().data(payload.to_string())),
                        Some(handle),
                    ))
                }
                Some(Err(error)) => {
                    let payload = json!({
                        "error": {
                            "code": match error {
                                AdapterError::Transient(_) => "backend_transient",
                                AdapterError::Permanent(_) => "backend_permanent",
                                AdapterError::Unsupported(_) => "model_unsupported",
                            },
                            "message": error.to_string(),
                        }
                    });
                    Some((Ok(Event::default().data(payload.to_string())), None))
                }
            }
        }
    })
}
