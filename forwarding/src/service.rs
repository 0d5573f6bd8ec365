//! Generation service and the escalation loop

use crate::confidence::estimate_confidence;
use inference_fabric_contracts::{
    Capability, ConfidenceRecord, GenerateRequest, GenerateResponse, GenerationStats,
    HardwareClass, RouterError, RoutingDecision, RoutingMetadata, StreamChunk,
};
use inference_fabric_registry::{
    AdapterError, AdapterResponse, BackendRegistry, InFlightGuard,
};
use inference_fabric_resilience::BreakerRegistry;
use inference_fabric_router::{RouteRequest, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub enabled: bool,
    /// Hardware tiers tried in order, cheapest first
    pub ladder: Vec<HardwareClass>,
    /// Minimum acceptable confidence before escalating
    pub min_confidence: f64,
    pub max_attempts: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ladder: vec![
                HardwareClass::Npu,
                HardwareClass::Igpu,
                HardwareClass::Dgpu,
            ],
            min_confidence: 0.6,
            max_attempts: 3,
        }
    }
}

/// A finished generation plus the forwarding trace that produced it
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub response: GenerateResponse,
    pub trace: Vec<ConfidenceRecord>,
}

/// A routed stream: chunks flow on the bounded channel, the in-flight
/// slot is held until the handle drops. Streams never escalate; the
/// backend is pinned for the stream's lifetime.
pub struct StreamHandle {
    pub decision: RoutingDecision,
    pub chunks: mpsc::Receiver<Result<StreamChunk, AdapterError>>,
    _guard: InFlightGuard,
}

fn adapter_error(backend_id: &str, error: AdapterError) -> RouterError {
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

/// Executes routed requests: single-shot, escalating, streaming, and
/// embeddings, all through the breaker and the in-flight accounting.
pub struct GenerationService {
    router: Arc<Router>,
    registry: Arc<BackendRegistry>,
    breakers: Arc<BreakerRegistry>,
    config: ForwardingConfig,
}

struct DeadlineBudget {
    deadline: Option<Instant>,
}

impl DeadlineBudget {
    fn new(deadline_ms: Option<u64>) -> Self {
        Self {
            deadline: deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
        }
    }

    fn remaining(&self) -> Result<Option<Duration>, RouterError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(RouterError::DeadlineExceeded)
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }
}

enum AttemptOutcome {
    Answer(AdapterResponse),
    Failed(String),
}

impl GenerationService {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<BackendRegistry>,
        breakers: Arc<BreakerRegistry>,
        config: ForwardingConfig,
    ) -> Self {
        Self {
            router,
            registry,
            breakers,
            config,
        }
    }

    pub fn forwarding_config(&self) -> &ForwardingConfig {
        &self.config
    }

    /// Non-streaming generation. Escalates up the ladder when forwarding
    /// is enabled; otherwise routes once.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerationOutcome, RouterError> {
        let budget = DeadlineBudget::new(request.annotations.deadline_ms);
        if self.config.enabled && !request.stream {
            self.generate_escalating(request, &budget).await
        } else {
            self.generate_once(request, &budget).await
        }
    }

    async fn generate_once(
        &self,
        request: &GenerateRequest,
        budget: &DeadlineBudget,
    ) -> Result<GenerationOutcome, RouterError> {
        let started = Instant::now();
        let route = RouteRequest::text_generation(
            request.model.clone(),
            request.prompt.clone(),
            request.annotations.clone(),
        );
        let decision = self.router.route(&route).await?;
        let outcome = self.attempt(request, &decision, budget).await?;
        match outcome {
            AttemptOutcome::Answer(answer) => {
                let estimate = estimate_confidence(&answer.text, &request.model);
                let record = ConfidenceRecord {
                    attempt: 1,
                    backend_id: decision.backend_id.clone(),
                    score: estimate.score,
                    reasons: estimate.reasons,
                    accepted: true,
                };
                let confidence = Some(record.score);
                Ok(self.outcome(decision, answer, vec![record], confidence, started))
            }
            AttemptOutcome::Failed(message) => Err(RouterError::BackendTransient {
                backend_id: decision.backend_id,
                message,
            }),
        }
    }

    async fn generate_escalating(
        &self,
        request: &GenerateRequest,
        budget: &DeadlineBudget,
    ) -> Result<GenerationOutcome, RouterError> {
        let started = Instant::now();
        let threshold = self.config.min_confidence;
        let max_attempts = self.config.max_attempts.min(self.config.ladder.len());

        let mut trace: Vec<ConfidenceRecord> = Vec::new();
        let mut tried: Vec<String> = Vec::new();
        let mut best: Option<(f64, AdapterResponse, RoutingDecision)> = None;

        for tier in self.config.ladder.iter().take(max_attempts) {
            budget.remaining()?;

            let mut route = RouteRequest::text_generation(
                request.model.clone(),
                request.prompt.clone(),
                request.annotations.clone(),
            );
            route.restrict_hardware = Some(*tier);
            route.exclude_backends = tried.clone();

            let decision = match self.router.route(&route).await {
                Ok(decision) => decision,
                Err(error) => {
                    debug!(tier = %tier, %error, "tier skipped");
                    continue;
                }
            };
            // Each backend is attempted at most once per request
            tried.push(decision.backend_id.clone());
            let attempt_index = trace.len() as u32 + 1;

            match self.attempt(request, &decision, budget).await {
                Ok(AttemptOutcome::Answer(answer)) => {
                    let estimate = estimate_confidence(&answer.text, &request.model);
                    let accepted = estimate.score >= threshold;
                    trace.push(ConfidenceRecord {
                        attempt: attempt_index,
                        backend_id: decision.backend_id.clone(),
                        score: estimate.score,
                        reasons: estimate.reasons,
                        accepted,
                    });
                    info!(
                        backend_id = %decision.backend_id,
                        score = estimate.score,
                        accepted,
                        "forwarding attempt scored"
                    );
                    if accepted {
                        let confidence = Some(estimate.score);
                        return Ok(self.outcome(decision, answer, trace, confidence, started));
                    }
                    let replace = best
                        .as_ref()
                        .map(|(score, _, _)| estimate.score > *score)
                        .unwrap_or(true);
                    if replace {
                        best = Some((estimate.score, answer, decision));
                    }
                }
                Ok(AttemptOutcome::Failed(message)) => {
                    trace.push(ConfidenceRecord {
                        attempt: attempt_index,
                        backend_id: decision.backend_id.clone(),
                        score: 0.0,
                        reasons: vec![message],
                        accepted: false,
                    });
                }
                Err(RouterError::BreakerOpen { backend_id }) => {
                    // Lost the race for a half-open probe slot; the next
                    // tier may still answer
                    trace.push(ConfidenceRecord {
                        attempt: attempt_index,
                        backend_id,
                        score: 0.0,
                        reasons: vec!["circuit breaker open".to_string()],
                        accepted: false,
                    });
                }
                Err(RouterError::BackendPermanent {
                    backend_id,
                    message,
                }) => {
                    // Retrying a malformed request up-ladder cannot help
                    return Err(RouterError::BackendPermanent {
                        backend_id,
                        message,
                    });
                }
                Err(error) => return Err(error),
            }
        }

        // Ladder exhausted: best effort wins
        if let Some((score, answer, decision)) = best {
            warn!(
                score,
                threshold, "ladder exhausted below threshold, returning best attempt"
            );
            return Ok(self.outcome(decision, answer, trace, Some(score), started));
        }
        Err(RouterError::NoCandidate {
            reason: format!(
                "escalation ladder exhausted after {} attempts without an answer",
                trace.len()
            ),
        })
    }

    /// One breaker-guarded, slot-accounted backend call
    async fn attempt(
        &self,
        request: &GenerateRequest,
        decision: &RoutingDecision,
        budget: &DeadlineBudget,
    ) -> Result<AttemptOutcome, RouterError> {
        let backend_id = &decision.backend_id;
        let breaker = self.breakers.for_backend(backend_id);
        if !breaker.acquire().await {
            return Err(RouterError::BreakerOpen {
                backend_id: backend_id.clone(),
            });
        }

        let entry = self
            .registry
            .get(backend_id)
            .ok_or_else(|| RouterError::InternalInvariant {
                message: format!("decision chose unregistered backend {}", backend_id),
            })?;
        let _guard = self.registry.begin_request(backend_id).await?;
        let adapter = entry.adapter();

        let call = adapter.generate(request);
        let result = match budget.remaining()? {
            Some(remaining) => match tokio::time::timeout(remaining, call).await {
                Ok(result) => result,
                // Deadline expiry is a caller-side condition; the breaker
                // counters stay untouched.
                Err(_) => return Err(RouterError::DeadlineExceeded),
            },
            None => call.await,
        };

        match result {
            Ok(answer) => {
                breaker.record_success().await;
                entry.record_success();
                Ok(AttemptOutcome::Answer(answer))
            }
            Err(error) => {
                if error.is_transient() {
                    breaker.record_failure().await;
                    entry.record_failure();
                    Ok(AttemptOutcome::Failed(error.to_string()))
                } else {
                    Err(adapter_error(backend_id, error))
                }
            }
        }
    }

    fn outcome(
        &self,
        decision: RoutingDecision,
        answer: AdapterResponse,
        trace: Vec<ConfidenceRecord>,
        confidence: Option<f64>,
        started: Instant,
    ) -> GenerationOutcome {
        let duration_ms = started.elapsed().as_millis() as u64;
        let response = GenerateResponse {
            text: answer.text,
            tokens: answer.tokens,
            estimated_energy_joules: decision.estimated_power_watts
                * (duration_ms as f64 / 1000.0),
            routing: RoutingMetadata::from(&decision),
            stats: GenerationStats {
                duration_ms,
                attempts: trace.len().max(1) as u32,
                time_to_first_token_ms: None,
                confidence,
            },
        };
        GenerationOutcome { response, trace }
    }

    /// Streamed generation: routed once, pinned to its backend
    pub async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<StreamHandle, RouterError> {
        let route = RouteRequest::text_generation(
            request.model.clone(),
            request.prompt.clone(),
            request.annotations.clone(),
        );
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
        let guard = self.registry.begin_request(&backend_id).await?;

        match entry.adapter().generate_stream(request).await {
            Ok(chunks) => {
                breaker.record_success().await;
                entry.record_success();
                Ok(StreamHandle {
                    decision,
                    chunks,
                    _guard: guard,
                })
            }
            Err(error) => {
                if error.is_transient() {
                    breaker.record_failure().await;
                    entry.record_failure();
                }
                Err(adapter_error(&backend_id, error))
            }
        }
    }

    /// Routed embeddings
    pub async fn embed(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<(RoutingDecision, Vec<Vec<f32>>), RouterError> {
        let mut route = RouteRequest::text_generation(model, "", Default::default());
        route.capability = Capability::Embeddings;
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

        match entry.adapter().embed(model, inputs).await {
            Ok(vectors) => {
                breaker.record_success().await;
                entry.record_success();
                Ok((decision, vectors))
            }
            Err(error) => {
                if error.is_transient() {
                    breaker.record_failure().await;
                    entry.record_failure();
                }
                Err(adapter_error(&backend_id, error))
            }
        }
    }

    /// Models visible across the routable pool, with the backends that
    /// serve each
    pub async fn aggregate_models(&self) -> Vec<(String, Vec<String>)> {
        let mut by_model: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();
        for entry in self.registry.snapshot() {
            if !entry.liveness().is_routable() {
                continue;
            }
            match entry.adapter().list_models().await {
                Ok(models) => {
                    for model in models {
                        by_model
                            .entry(model.id)
                            .or_default()
                            .push(entry.descriptor.id.clone());
                    }
                }
                Err(error) => {
                    warn!(
                        backend_id = %entry.descriptor.id,
                        %error,
                        "model listing failed"
                    );
                }
            }
        }
        by_model.into_iter().collect()
    }
}
