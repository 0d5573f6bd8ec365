//! Property tests over generated pools, profiles, and telemetry

mod common;

use common::{descriptor, EchoAdapter};
use inference_fabric_contracts::{
    EfficiencyMode, EfficiencyProfile, HardwareClass, Liveness, RequestAnnotations,
};
use inference_fabric_efficiency::{
    EfficiencyConfig, EfficiencyManager, PowerStatus, StaticClock, StaticPowerSource,
};
use inference_fabric_registry::BackendRegistry;
use inference_fabric_resilience::{BreakerConfig, BreakerRegistry};
use inference_fabric_router::{RouteRequest, Router};
use inference_fabric_thermal::{StaticProbe, TelemetryProbe, TelemetrySample, ThermalMonitor};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct GeneratedBackend {
    hardware: HardwareClass,
    power: f64,
    latency: u64,
    priority: u32,
    max_temp: f64,
    temp_ratio: f64,
    throttling: bool,
}

fn backend_strategy() -> impl Strategy<Value = GeneratedBackend> {
    (
        prop_oneof![
            Just(HardwareClass::Npu),
            Just(HardwareClass::Igpu),
            Just(HardwareClass::Dgpu),
            Just(HardwareClass::Cpu),
        ],
        1.0f64..60.0,
        50u64..1000,
        1u32..50,
        60.0f64..100.0,
        0.3f64..1.05,
        prop::bool::weighted(0.15),
    )
        .prop_map(
            |(hardware, power, latency, priority, max_temp, temp_ratio, throttling)| {
                GeneratedBackend {
                    hardware,
                    power,
                    latency,
                    priority,
                    max_temp,
                    temp_ratio,
                    throttling,
                }
            },
        )
}

fn mode_strategy() -> impl Strategy<Value = EfficiencyMode> {
    prop_oneof![
        Just(EfficiencyMode::Performance),
        Just(EfficiencyMode::Balanced),
        Just(EfficiencyMode::Efficiency),
        Just(EfficiencyMode::Quiet),
        Just(EfficiencyMode::UltraEfficiency),
    ]
}

struct Harness {
    router: Router,
    thermal: Arc<ThermalMonitor>,
}

/// Build a pool from generated backends plus one always-viable NPU anchor
/// so non-Performance profiles always keep a compliant candidate.
async fn harness(backends: &[GeneratedBackend], mode: EfficiencyMode) -> Harness {
    let registry = Arc::new(BackendRegistry::new());
    let mut thermal_backends = Vec::new();

    let mut all = vec![(
        descriptor("anchor-npu", HardwareClass::Npu, 3.0, 400, 0.0, 70.0, 25),
        TelemetrySample {
            temperature_celsius: 40.0,
            fan_percent: 0.0,
            throttling: false,
            power_watts: 2.0,
        },
    )];
    for (index, backend) in backends.iter().enumerate() {
        all.push((
            descriptor(
                &format!("backend-{}", index),
                backend.hardware,
                backend.power,
                backend.latency,
                0.0,
                backend.max_temp,
                backend.priority,
            ),
            TelemetrySample {
                temperature_celsius: backend.max_temp * backend.temp_ratio,
                fan_percent: 0.0,
                throttling: backend.throttling,
                power_watts: backend.power,
            },
        ));
    }

    for (descriptor, sample) in &all {
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
        thermal_backends.push((
            descriptor.clone(),
            Arc::new(StaticProbe::new(*sample)) as Arc<dyn TelemetryProbe>,
        ));
    }

    let thermal = Arc::new(ThermalMonitor::new(thermal_backends, Duration::from_secs(1)));
    thermal.poll_once().await;

    let efficiency = Arc::new(EfficiencyManager::new(
        EfficiencyConfig::default(),
        Arc::new(StaticPowerSource::new(PowerStatus::default())),
        Arc::new(StaticClock::at(12, 0)),
    ));
    efficiency.set_mode(mode).await.unwrap();

    let router = Router::new(
        registry,
        thermal.clone(),
        efficiency,
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
    );
    Harness { router, thermal }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // P1: a decision never leaves the profile's hardware set, never picks
    // a backend over its temperature limit, and never picks a throttler.
    #[test]
    fn chosen_backend_respects_profile_and_thermals(
        backends in prop::collection::vec(backend_strategy(), 1..4),
        mode in mode_strategy(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let harness = harness(&backends, mode).await;
            let request = RouteRequest::text_generation(
                "llama3:3b",
                "Summarize the operational report in a few paragraphs please.",
                RequestAnnotations::default(),
            );
            if let Ok(decision) = harness.router.route(&request).await {
                let profile = EfficiencyProfile::for_mode(mode).unwrap();
                let snapshot = harness.thermal.snapshot();
                let reading = snapshot.reading(&decision.backend_id).unwrap();
                prop_assert!(!reading.throttling);
                prop_assert!(reading.temperature_celsius <= profile.max_temp_celsius);
                if decision.backend_id == "anchor-npu" {
                    prop_assert!(profile.allows_hardware(HardwareClass::Npu));
                } else {
                    let index: usize = decision.backend_id
                        .strip_prefix("backend-").unwrap().parse().unwrap();
                    prop_assert!(profile.allows_hardware(backends[index].hardware));
                    prop_assert!(
                        reading.temperature_celsius <= backends[index].max_temp
                    );
                }
            }
            Ok(())
        })?;
    }

    // P2: outside Performance, an unjustified latency-critical flag gets
    // overridden onto a backend inside the mode's power envelope.
    #[test]
    fn unjustified_critical_flag_is_overridden(
        backends in prop::collection::vec(backend_strategy(), 1..4),
        mode in mode_strategy(),
    ) {
        prop_assume!(mode != EfficiencyMode::Performance);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let harness = harness(&backends, mode).await;
            let request = RouteRequest::text_generation(
                "llama3:3b",
                "What is 2+2?",
                RequestAnnotations {
                    latency_critical: true,
                    ..Default::default()
                },
            );
            let decision = harness.router.route(&request).await
                .expect("the anchor NPU is always a candidate");
            let profile = EfficiencyProfile::for_mode(mode).unwrap();
            prop_assert!(profile.permits_power(decision.estimated_power_watts));
            prop_assert!(decision.override_applied);
            Ok(())
        })?;
    }

    // P3: the router is deterministic over a frozen snapshot.
    #[test]
    fn routing_is_deterministic(
        backends in prop::collection::vec(backend_strategy(), 1..4),
        mode in mode_strategy(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let harness = harness(&backends, mode).await;
            let request = RouteRequest::text_generation(
                "llama3:8b",
                "Write a 500-word essay on transformers.",
                RequestAnnotations::default(),
            );
            let first = harness.router.route(&request).await;
            let second = harness.router.route(&request).await;
            match (first, second) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(a), Err(b)) => prop_assert_eq!(a.code(), b.code()),
                _ => prop_assert!(false, "one attempt failed, the other did not"),
            }
            Ok(())
        })?;
    }
}
