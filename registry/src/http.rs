//! OpenAI-dialect HTTP adapter
//!
//! All local engines expose an OpenAI-compatible surface; one adapter with
//! a per-backend `reqwest` client covers the pool. Streaming reads the
//! engine's SSE frames and re-emits them as chunks on a bounded channel.

use crate::adapter::{
    AdapterError, AdapterModel, AdapterResponse, BackendAdapter, STREAM_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use futures::StreamExt;
use inference_fabric_contracts::{Capability, GenerateRequest, StreamChunk};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_max_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            pool_max_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct ModelDatum {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelDatum>,
}

/// HTTP adapter for one engine endpoint
#[derive(Debug)]
pub struct OpenAiHttpAdapter {
    backend_id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    client: reqwest::Client,
}

impl OpenAiHttpAdapter {
    pub fn new(
        backend_id: impl Into<String>,
        base_url: impl Into<String>,
        capabilities: Vec<Capability>,
        config: HttpAdapterConfig,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()
            .map_err(|e| AdapterError::Permanent(format!("client build: {}", e)))?;
        let base_url = base_url.into();
        Ok(Self {
            backend_id: backend_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            capabilities,
            client,
        })
    }

    fn classify(error: reqwest::Error) -> AdapterError {
        if error.is_timeout() || error.is_connect() {
            return AdapterError::Transient(error.to_string());
        }
        AdapterError::Transient(format!("transport: {}", error))
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> AdapterError {
        if status.is_server_error() || status.as_u16() == 429 {
            AdapterError::Transient(format!("{}: {}", status, body))
        } else {
            AdapterError::Permanent(format!("{}: {}", status, body))
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify_status(status, body))
    }
}

#[async_trait]
impl BackendAdapter for OpenAiHttpAdapter {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<AdapterResponse, AdapterError> {
        let body = CompletionRequest {
            model: &request.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };
        let response = self
            .client
            .post(format!("{}/v1/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("malformed response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| AdapterError::Permanent("response had no choices".to_string()))?;
        let tokens = parsed
            .usage
            .map(|u| u.completion_tokens)
            // Engines that omit usage still get a rough count
            .unwrap_or_else(|| text.split_whitespace().count() as u32);

        Ok(AdapterResponse { text, tokens })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, AdapterError>>, AdapterError> {
        let body = CompletionRequest {
            model: &request.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        };
        let response = self
            .client
            .post(format!("{}/v1/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let request_id = request.request_id();
        let backend_id = self.backend_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut first_chunk = true;
            let mut buffer = String::new();
            let mut byte_stream = response.bytes_stream();

            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        let _ = tx
                            .send(Err(AdapterError::Transient(format!(
                                "stream read: {}",
                                error
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        let _ = tx
                            .send(Ok(StreamChunk {
                                request_id: request_id.clone(),
                                content: String::new(),
                                done: true,
                                time_to_first_token_ms: None,
                            }))
                            .await;
                        return;
                    }
                    match serde_json::from_str::<StreamFrame>(payload) {
                        Ok(frame) => {
                            let content: String =
                                frame.choices.into_iter().map(|c| c.text).collect();
                            if content.is_empty() {
                                continue;
                            }
                            let ttft = if first_chunk {
                                first_chunk = false;
                                Some(started.elapsed().as_millis() as u64)
                            } else {
                                None
                            };
                            // A full channel blocks here, back-pressuring
                            // the engine through the open connection.
                            if tx
                                .send(Ok(StreamChunk {
                                    request_id: request_id.clone(),
                                    content,
                                    done: false,
                                    time_to_first_token_ms: ttft,
                                }))
                                .await
                                .is_err()
                            {
                                debug!(backend_id = %backend_id, "stream receiver dropped");
                                return;
                            }
                        }
                        Err(error) => {
                            warn!(backend_id = %backend_id, %error, "bad stream frame");
                        }
                    }
                }
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    request_id,
                    content: String::new(),
                    done: true,
                    time_to_first_token_ms: None,
                }))
                .await;
        });

        Ok(rx)
    }

    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, AdapterError> {
        if !self.supports(Capability::Embeddings) {
            return Err(AdapterError::Unsupported(format!(
                "{} does not serve embeddings",
                self.backend_id
            )));
        }
        let body = EmbeddingRequest {
            model,
            input: inputs,
        };
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("malformed response: {}", e)))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn list_models(&self) -> Result<Vec<AdapterModel>, AdapterError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check(response).await?;
        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("malformed response: {}", e)))?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| AdapterModel { id: m.id })
            .collect())
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(Self::classify)?;
        Self::check(response).await.map(|_| ())
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(base_url: &str) -> OpenAiHttpAdapter {
        OpenAiHttpAdapter::new(
            "ollama-npu",
            base_url,
            vec![Capability::TextGeneration, Capability::Embeddings],
            HttpAdapterConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn generate_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"text":"4"}],"usage":{"completion_tokens":1}}"#,
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = GenerateRequest::new("llama3", "What is 2+2?");
        let response = adapter.generate(&request).await.unwrap();
        assert_eq!(response.text, "4");
        assert_eq!(response.tokens, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_classify_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = GenerateRequest::new("llama3", "hi");
        let error = adapter.generate(&request).await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn client_errors_classify_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(404)
            .with_body("no such model")
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = GenerateRequest::new("missing", "hi");
        let error = adapter.generate(&request).await.unwrap_err();
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn list_models_parses_ids() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"llama3:8b"},{"id":"phi3"}]}"#)
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "llama3:8b");
    }

    #[tokio::test]
    async fn embed_requires_capability() {
        let adapter = OpenAiHttpAdapter::new(
            "ollama-npu",
            "http://127.0.0.1:9",
            vec![Capability::TextGeneration],
            HttpAdapterConfig::default(),
        )
        .unwrap();
        let error = adapter.embed("m", &["x".to_string()]).await.unwrap_err();
        assert!(matches!(error, AdapterError::Unsupported(_)));
    }

    #[tokio::test]
    async fn stream_emits_chunks_and_done() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body(
                "data: {\"choices\":[{\"text\":\"Hel\"}]}\n\
                 data: {\"choices\":[{\"text\":\"lo\"}]}\n\
                 data: [DONE]\n",
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let request = GenerateRequest::new("llama3", "say hello");
        let mut rx = adapter.generate_stream(&request).await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.content, "Hel");
        assert!(first.time_to_first_token_ms.is_some());
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.content, "lo");
        assert!(second.time_to_first_token_ms.is_none());
        let last = rx.recv().await.unwrap().unwrap();
        assert!(last.done);
    }
}
