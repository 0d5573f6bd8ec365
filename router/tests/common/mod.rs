//! Shared fixture: four backends on fake telemetry and a fake battery
#![allow(dead_code)]

use async_trait::async_trait;
use inference_fabric_contracts::{
    BackendCharacteristics, BackendDescriptor, Capability, EfficiencyMode, GenerateRequest,
    HardwareClass, Liveness, StreamChunk,
};
use inference_fabric_efficiency::{
    EfficiencyConfig, EfficiencyManager, PowerStatus, StaticClock, StaticPowerSource,
};
use inference_fabric_registry::{
    AdapterError, AdapterModel, AdapterResponse, BackendAdapter, BackendRegistry,
};
use inference_fabric_resilience::{BreakerConfig, BreakerRegistry};
use inference_fabric_router::Router;
use inference_fabric_thermal::{StaticProbe, TelemetryProbe, TelemetrySample, ThermalMonitor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct EchoAdapter {
    pub id: String,
}

#[async_trait]
impl BackendAdapter for EchoAdapter {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        Ok(AdapterResponse {
            text: format!("{} answered", request.model),
            tokens: 2,
        })
    }

    async fn generate_stream(
        &self,
        _request: &GenerateRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, AdapterError>>, AdapterError>
    {
        Err(AdapterError::Unsupported("stream".to_string()))
    }

    async fn embed(
        &self,
        _model: &str,
        _inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, AdapterError> {
        Ok(vec![vec![0.0; 8]])
    }

    async fn list_models(&self) -> Result<Vec<AdapterModel>, AdapterError> {
        Ok(vec![])
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }
}

pub fn descriptor(
    id: &str,
    hardware: HardwareClass,
    power: f64,
    latency: u64,
    max_fan: f64,
    max_temp: f64,
    priority: u32,
) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        hardware,
        endpoint: format!("http://127.0.0.1:11434/{}", id),
        priority,
        characteristics: BackendCharacteristics {
            nominal_power_watts: power,
            nominal_latency_ms: latency,
            max_fan_percent: max_fan,
            max_temp_celsius: max_temp,
            capabilities: vec![
                Capability::TextGeneration,
                Capability::Embeddings,
                Capability::AudioToText,
                Capability::TextToAudio,
            ],
        },
        models: vec![],
    }
}

pub struct Fixture {
    pub registry: Arc<BackendRegistry>,
    pub thermal: Arc<ThermalMonitor>,
    pub efficiency: Arc<EfficiencyManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub router: Arc<Router>,
    pub probes: HashMap<String, Arc<StaticProbe>>,
    pub power: Arc<StaticPowerSource>,
}

impl Fixture {
    pub async fn set_mode(&self, mode: EfficiencyMode) {
        self.efficiency.set_mode(mode).await.unwrap();
    }

    pub async fn set_telemetry(&self, backend_id: &str, temp: f64, fan: f64) {
        self.probes[backend_id].set(TelemetrySample {
            temperature_celsius: temp,
            fan_percent: fan,
            throttling: false,
            power_watts: 0.0,
        });
        self.thermal.poll_once().await;
    }
}

/// Pool: npu 4W/300ms, igpu 12W/180ms, nvidia 45W/80ms, cpu 20W/900ms.
/// Priorities prefer the cheaper tier on ties.
pub async fn fixture() -> Fixture {
    let descriptors = vec![
        descriptor("ollama-npu", HardwareClass::Npu, 4.0, 300, 0.0, 70.0, 40),
        descriptor("ollama-igpu", HardwareClass::Igpu, 12.0, 180, 80.0, 85.0, 30),
        descriptor("ollama-nvidia", HardwareClass::Dgpu, 45.0, 80, 100.0, 95.0, 20),
        descriptor("ollama-cpu", HardwareClass::Cpu, 20.0, 900, 0.0, 90.0, 10),
    ];

    let registry = Arc::new(BackendRegistry::new());
    let mut probes = HashMap::new();
    let mut thermal_backends = Vec::new();
    for descriptor in descriptors {
        // Passively cooled tiers idle at 0% fan
        let fan = if descriptor.characteristics.max_fan_percent > 0.0 {
            10.0
        } else {
            0.0
        };
        let probe = Arc::new(StaticProbe::new(TelemetrySample {
            temperature_celsius: 45.0,
            fan_percent: fan,
            throttling: false,
            power_watts: 0.0,
        }));
        probes.insert(descriptor.id.clone(), probe.clone());
        thermal_backends.push((descriptor.clone(), probe as Arc<dyn TelemetryProbe>));
        registry.register(
            descriptor.clone(),
            Arc::new(EchoAdapter {
                id: descriptor.id.clone(),
            }),
            8,
        );
        registry
            .get(&descriptor.id)
            .unwrap()
            .set_liveness(Liveness::Up);
    }

    let thermal = Arc::new(ThermalMonitor::new(
        thermal_backends,
        Duration::from_secs(1),
    ));
    thermal.poll_once().await;

    let power = Arc::new(StaticPowerSource::new(PowerStatus::default()));
    let efficiency = Arc::new(EfficiencyManager::new(
        EfficiencyConfig::default(),
        power.clone(),
        Arc::new(StaticClock::at(12, 0)),
    ));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let router = Arc::new(Router::new(
        registry.clone(),
        thermal.clone(),
        efficiency.clone(),
        breakers.clone(),
    ));

    Fixture {
        registry,
        thermal,
        efficiency,
        breakers,
        router,
        probes,
        power,
    }
}
