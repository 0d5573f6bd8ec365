//! WebSocket streaming
//!
//! `GET /v1/stream/ws` upgrades to a socket speaking JSON frames: the
//! client sends a generation request, the server answers with per-token
//! chunk frames (the first carrying time-to-first-token) and a final
//! `done` frame with the routing metadata.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use inference_fabric_contracts::{
    GenerateRequest, RequestAnnotations, RoutingMetadata, StreamChunk,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct WsRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    annotations: RequestAnnotations,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
}

pub async fn stream_ws(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(|socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    info!("websocket stream opened");
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: WsRequest = match serde_json::from_str(&message) {
            Ok(parsed) => parsed,
            Err(error) => {
                let _ = send_error(&mut socket, "invalid_annotation", &error.to_string())
                    .await;
                continue;
            }
        };

        let request = GenerateRequest {
            id: Uuid::new_v4(),
            model: parsed.model,
            prompt: parsed.prompt,
            annotations: parsed.annotations,
            max_tokens: parsed.max_tokens,
            temperature: parsed.temperature,
            stream: true,
        };
        let request_id = request.request_id();

        let mut handle = match state.service.generate_stream(&request).await {
            Ok(handle) => handle,
            Err(error) => {
                let _ = send_error(&mut socket, error.code(), &error.to_string()).await;
                continue;
            }
        };
        state
            .metrics
            .observe_request(&handle.decision.backend_id, "stream", 0.0);
        let routing = RoutingMetadata::from(&handle.decision);

        while let Some(chunk) = handle.chunks.recv().await {
            match chunk {
                Ok(StreamChunk { done: true, .. }) => break,
                Ok(chunk) => {
                    let frame = json!({
                        "type": "chunk",
                        "request_id": request_id,
                        "content": chunk.content,
                        "time_to_first_token_ms": chunk.time_to_first_token_ms,
                    });
                    if socket
                        .send(Message::Text(frame.to_string()))
                        .await
                        .is_err()
                    {
                        debug!("websocket client went away mid-stream");
                        return;
                    }
                }
                Err(error) => {
                    warn!(%error, "backend stream error on websocket");
                    let _ = send_error(&mut socket, "backend_transient", &error.to_string())
                        .await;
                    break;
                }
            }
        }

        let done = json!({
            "type": "done",
            "request_id": request_id,
            "routing": routing,
        });
        if socket.send(Message::Text(done.to_string())).await.is_err() {
            return;
        }
    }
    info!("websocket stream closed");
}

async fn send_error(
    socket: &mut WebSocket,
    code: &str,
    message: &str,
) -> Result<(), axum::Error> {
    let frame = json!({"type": "error", "code": code, "message": message});
    socket.send(Message::Text(frame.to_string())).await
}
