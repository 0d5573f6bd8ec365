//! Stage orchestration

use inference_fabric_contracts::{
    Capability, GenerateRequest, RequestAnnotations, RouterError,
};
use inference_fabric_registry::BackendRegistry;
use inference_fabric_resilience::BreakerRegistry;
use inference_fabric_router::{RouteRequest, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a stage does; maps one-to-one onto an adapter capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    AudioToText,
    TextGen,
    TextToAudio,
    ImageToText,
    Embedding,
}

impl StageKind {
    pub fn capability(&self) -> Capability {
        match self {
            StageKind::AudioToText => Capability::AudioToText,
            StageKind::TextGen => Capability::TextGeneration,
            StageKind::TextToAudio => Capability::TextToAudio,
            StageKind::ImageToText => Capability::ImageToText,
            StageKind::Embedding => Capability::Embeddings,
        }
    }

    /// Relative share of the pipeline deadline this stage kind usually
    /// needs; generation dominates a voice round-trip.
    fn nominal_weight(&self) -> f64 {
        match self {
            StageKind::AudioToText => 1.0,
            StageKind::TextGen => 3.0,
            StageKind::TextToAudio => 1.0,
            StageKind::ImageToText => 1.5,
            StageKind::Embedding => 0.5,
        }
    }
}

/// One step of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub kind: StageKind,
    pub model: String,
    /// Backend hint; the router may override it like any target
    #[serde(default)]
    pub preferred_backend: Option<String>,
}

/// Data flowing between stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageData {
    Text(String),
    /// Raw audio bytes; handed to engines base64-encoded
    Audio(Vec<u8>),
}

impl StageData {
    fn into_prompt(self) -> String {
        match self {
            StageData::Text(text) => text,
            StageData::Audio(bytes) => encode_base64(&bytes),
        }
    }
}

fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// What happened in one completed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub index: usize,
    pub kind: StageKind,
    pub backend_id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub output: StageData,
    pub trace: Vec<StageResult>,
}

/// A failed pipeline surfaces the stages that did complete
#[derive(Debug, thiserror::Error)]
#[error("pipeline aborted at stage {failed_stage}: {error}")]
pub struct PipelineFailure {
    pub failed_stage: usize,
    #[source]
    pub error: RouterError,
    pub trace: Vec<StageResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub stages: Vec<PipelineStage>,
    pub input: StageData,
    /// Overall budget, split across stages proportionally to their
    /// nominal weight
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

pub struct PipelineExecutor {
    router: Arc<Router>,
    registry: Arc<BackendRegistry>,
    breakers: Arc<BreakerRegistry>,
}

impl PipelineExecutor {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<BackendRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            router,
            registry,
            breakers,
        }
    }

    pub async fn execute(
        &self,
        request: PipelineRequest,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        if request.stages.is_empty() {
            return Err(PipelineFailure {
                failed_stage: 0,
                error: RouterError::InvalidAnnotation {
                    message: "pipeline has no stages".to_string(),
                },
                trace: Vec::new(),
            });
        }

        let total_weight: f64 = request
            .stages
            .iter()
            .map(|stage| stage.kind.nominal_weight())
            .sum();
        let overall_deadline = request.deadline_ms;

        let mut trace: Vec<StageResult> = Vec::new();
        let mut data = request.input;

        for (index, stage) in request.stages.iter().enumerate() {
            let stage_deadline = overall_deadline.map(|total| {
                let share = stage.kind.nominal_weight() / total_weight;
                ((total as f64) * share).max(1.0) as u64
            });
            debug!(
                index,
                kind = ?stage.kind,
                deadline_ms = ?stage_deadline,
                "executing pipeline stage"
            );

            let started = Instant::now();
            match self.run_stage(stage, data, stage_deadline).await {
                Ok((backend_id, output)) => {
                    trace.push(StageResult {
                        index,
                        kind: stage.kind,
                        backend_id,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    data = output;
                }
                Err(error) => {
                    warn!(index, kind = ?stage.kind, %error, "pipeline stage failed");
                    return Err(PipelineFailure {
                        failed_stage: index,
                        error,
                        trace,
                    });
                }
            }
        }

        info!(stages = trace.len(), "pipeline completed");
        Ok(PipelineOutcome {
            output: data,
            trace,
        })
    }

    /// Route and run one stage through the breaker and slot accounting
    async fn run_stage(
        &self,
        stage: &PipelineStage,
        input: StageData,
        deadline_ms: Option<u64>,
    ) -> Result<(String, StageData), RouterError> {
        let prompt = input.into_prompt();
        let mut route = RouteRequest::text_generation(
            stage.model.clone(),
            prompt.clone(),
            RequestAnnotations {
                target: stage.preferred_backend.clone(),
                ..Default::default()
            },
        );
        route.capability = stage.kind.capability();
        let decision = self.router.route(&route).await?;
        let backend_id = decision.backend_id.clone();

        let breaker = self.breakers.for_backend(&backend_id);
        if !breaker.acquire().await {
            return Err(RouterError::BreakerOpen { backend_id });
        }
        let entry = self
            .registry
            .get(&backend_id)
            .ok_or_else(|| RouterError::InternalInvariant {
                message: format!("decision chose unregistered backend {}", backend_id),
            })?;
        let _guard = self.registry.begin_request(&backend_id).await?;
        let adapter = entry.adapter();

        let output = match stage.kind {
            StageKind::Embedding => {
                let prompt_batch = [prompt];
                let call = adapter.embed(&stage.model, &prompt_batch);
                let vectors = match deadline_ms {
                    Some(ms) => {
                        match tokio::time::timeout(Duration::from_millis(ms), call).await {
                            Ok(result) => result,
                            Err(_) => return Err(RouterError::DeadlineExceeded),
                        }
                    }
                    None => call.await,
                };
                match vectors {
                    Ok(vectors) => {
                        breaker.record_success().await;
                        entry.record_success();
                        StageData::Text(
                            serde_json::to_string(&vectors).unwrap_or_default(),
                        )
                    }
                    Err(error) => {
                        if error.is_transient() {
                            breaker.record_failure().await;
                            entry.record_failure();
                        }
                        return Err(stage_error(&backend_id, error));
                    }
                }
            }
            _ => {
                let generate = GenerateRequest::new(stage.model.clone(), prompt);
                let call = adapter.generate(&generate);
                let result = match deadline_ms {
                    Some(ms) => {
                        match tokio::time::timeout(Duration::from_millis(ms), call).await {
                            Ok(result) => result,
                            Err(_) => return Err(RouterError::DeadlineExceeded),
                        }
                    }
                    None => call.await,
                };
                match result {
                    Ok(answer) => {
                        breaker.record_success().await;
                        entry.record_success();
                        match stage.kind {
                            // Synthesis returns audio; engines ship it
                            // base64 in the text field
                            StageKind::TextToAudio => {
                                StageData::Audio(answer.text.into_bytes())
                            }
                            _ => StageData::Text(answer.text),
                        }
                    }
                    Err(error) => {
                        if error.is_transient() {
                            breaker.record_failure().await;
                            entry.record_failure();
                        }
                        return Err(stage_error(&backend_id, error));
                    }
                }
            }
        };

        Ok((backend_id, output))
    }
}

fn stage_error(
    backend_id: &str,
    error: inference_fabric_registry::AdapterError,
) -> RouterError {
    use inference_fabric_registry::AdapterError;
    match error {
        AdapterError::Transient(message) => RouterError::BackendTransient {
            backend_id: backend_id.to_string(),
            message,
        },
        AdapterError::Permanent(message) => RouterError::BackendPermanent {
            backend_id: backend_id.to_string(),
            message,
        },
        AdapterError::Unsupported(message) => RouterError::ModelUnsupported { model: message },
    }
}
