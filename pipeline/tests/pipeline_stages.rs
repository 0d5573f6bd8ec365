//! Multi-stage execution: capability routing, chaining, and aborts

use async_trait::async_trait;
use inference_fabric_contracts::{
    BackendCharacteristics, BackendDescriptor, Capability, EfficiencyMode, GenerateRequest,
    HardwareClass, Liveness, StreamChunk,
};
use inference_fabric_efficiency::{
    EfficiencyConfig, EfficiencyManager, PowerStatus, StaticClock, StaticPowerSource,
};
use inference_fabric_pipeline::{
    PipelineExecutor, PipelineRequest, PipelineStage, StageData, StageKind,
};
use inference_fabric_registry::{
    AdapterError, AdapterModel, AdapterResponse, BackendAdapter, BackendRegistry,
};
use inference_fabric_resilience::{BreakerConfig, BreakerRegistry};
use inference_fabric_router::Router;
use inference_fabric_thermal::{StaticProbe, TelemetryProbe, TelemetrySample, ThermalMonitor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Echoes its role into the output so chaining is observable
#[derive(Debug)]
struct RoleAdapter {
    id: String,
    capabilities: Vec<Capability>,
    fail: bool,
}

#[async_trait]
impl BackendAdapter for RoleAdapter {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        if self.fail {
            return Err(AdapterError::Transient("engine offline".to_string()));
        }
        Ok(AdapterResponse {
            text: format!("{}({})", self.id, request.prompt),
            tokens: 1,
        })
    }

    async fn generate_stream(
        &self,
        _request: &GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, AdapterError>>, AdapterError> {
        Err(AdapterError::Unsupported("stream".to_string()))
    }

    async fn embed(
        &self,
        _model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, AdapterError> {
        Ok(inputs.iter().map(|_| vec![0.5_f32; 4]).collect())
    }

    async fn list_models(&self) -> Result<Vec<AdapterModel>, AdapterError> {
        Ok(vec![])
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

fn descriptor(
    id: &str,
    hardware: HardwareClass,
    capabilities: Vec<Capability>,
) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        hardware,
        endpoint: format!("http://127.0.0.1:11434/{}", id),
        priority: 10,
        characteristics: BackendCharacteristics {
            nominal_power_watts: 8.0,
            nominal_latency_ms: 200,
            max_fan_percent: 0.0,
            max_temp_celsius: 90.0,
            capabilities,
        },
        models: vec![],
    }
}

async fn executor(audio_fails: bool) -> PipelineExecutor {
    let registry = Arc::new(BackendRegistry::new());
    let mut thermal_backends = Vec::new();

    let pool = vec![
        (
            "audio-npu",
            HardwareClass::Npu,
            vec![Capability::AudioToText, Capability::TextToAudio],
            audio_fails,
        ),
        (
            "text-igpu",
            HardwareClass::Igpu,
            vec![Capability::TextGeneration, Capability::Embeddings],
            false,
        ),
    ];
    for (id, hardware, capabilities, fail) in pool {
        let descriptor = descriptor(id, hardware, capabilities.clone());
        registry.register(
            descriptor.clone(),
            Arc::new(RoleAdapter {
                id: id.to_string(),
                capabilities,
                fail,
            }),
            4,
        );
        registry.get(id).unwrap().set_liveness(Liveness::Up);
        thermal_backends.push((
            descriptor,
            Arc::new(StaticProbe::new(TelemetrySample {
                temperature_celsius: 40.0,
                fan_percent: 0.0,
                throttling: false,
                power_watts: 5.0,
            })) as Arc<dyn TelemetryProbe>,
        ));
    }

    let thermal = Arc::new(ThermalMonitor::new(thermal_backends, Duration::from_secs(1)));
    thermal.poll_once().await;
    let efficiency = Arc::new(EfficiencyManager::new(
        EfficiencyConfig::default(),
        Arc::new(StaticPowerSource::new(PowerStatus::default())),
        Arc::new(StaticClock::at(12, 0)),
    ));
    efficiency.set_mode(EfficiencyMode::Balanced).await.unwrap();
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let router = Arc::new(Router::new(
        registry.clone(),
        thermal,
        efficiency,
        breakers.clone(),
    ));
    PipelineExecutor::new(router, registry, breakers)
}

fn voice_round_trip() -> Vec<PipelineStage> {
    vec![
        PipelineStage {
            kind: StageKind::AudioToText,
            model: "whisper-small".to_string(),
            preferred_backend: None,
        },
        PipelineStage {
            kind: StageKind::TextGen,
            model: "llama3:8b".to_string(),
            preferred_backend: None,
        },
        PipelineStage {
            kind: StageKind::TextToAudio,
            model: "tts-small".to_string(),
            preferred_backend: None,
        },
    ]
}

#[tokio::test]
async fn stages_route_by_capability_and_chain_outputs() {
    let executor = executor(false).await;
    let outcome = executor
        .execute(PipelineRequest {
            stages: voice_round_trip(),
            input: StageData::Audio(vec![1, 2, 3]),
            deadline_ms: Some(5_000),
        })
        .await
        .unwrap();

    assert_eq!(outcome.trace.len(), 3);
    assert_eq!(outcome.trace[0].backend_id, "audio-npu");
    assert_eq!(outcome.trace[1].backend_id, "text-igpu");
    assert_eq!(outcome.trace[2].backend_id, "audio-npu");

    // Output carries the full chain: tts(llm(stt(audio)))
    match outcome.output {
        StageData::Audio(bytes) => {
            let text = String::from_utf8(bytes).unwrap();
            assert!(text.starts_with("audio-npu(text-igpu(audio-npu("));
        }
        StageData::Text(text) => panic!("expected audio out, got text: {}", text),
    }
}

#[tokio::test]
async fn stage_failure_aborts_with_partial_trace() {
    let executor = executor(true).await;
    let failure = executor
        .execute(PipelineRequest {
            stages: voice_round_trip(),
            input: StageData::Audio(vec![1, 2, 3]),
            deadline_ms: None,
        })
        .await
        .unwrap_err();

    assert_eq!(failure.failed_stage, 0);
    assert!(failure.trace.is_empty());
    assert_eq!(failure.error.code(), "backend_transient");
}

#[tokio::test]
async fn missing_capability_is_no_candidate() {
    let executor = executor(false).await;
    let failure = executor
        .execute(PipelineRequest {
            stages: vec![PipelineStage {
                kind: StageKind::ImageToText,
                model: "llava".to_string(),
                preferred_backend: None,
            }],
            input: StageData::Text("describe".to_string()),
            deadline_ms: None,
        })
        .await
        .unwrap_err();
    assert_eq!(failure.error.code(), "no_candidate");
}

#[tokio::test]
async fn embedding_stage_produces_vector_json() {
    let executor = executor(false).await;
    let outcome = executor
        .execute(PipelineRequest {
            stages: vec![PipelineStage {
                kind: StageKind::Embedding,
                model: "nomic-embed-text".to_string(),
                preferred_backend: None,
            }],
            input: StageData::Text("embed this".to_string()),
            deadline_ms: None,
        })
        .await
        .unwrap();

    match outcome.output {
        StageData::Text(json) => {
            let vectors: Vec<Vec<f32>> = serde_json::from_str(&json).unwrap();
            assert_eq!(vectors[0].len(), 4);
        }
        StageData::Audio(_) => panic!("expected text"),
    }
}
