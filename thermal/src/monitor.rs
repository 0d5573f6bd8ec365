//! Polling monitor and health derivation

use crate::probe::{TelemetryProbe, TelemetrySample};
use inference_fabric_contracts::{BackendDescriptor, EfficiencyProfile};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health bands derived from temperature, fan, throttle, and reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Everything the router needs to know about one backend's thermals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalReading {
    pub backend_id: String,
    pub temperature_celsius: f64,
    pub fan_percent: f64,
    pub throttling: bool,
    pub power_watts: f64,
    pub reachable: bool,
    pub health: ThermalHealth,
    pub last_update: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
struct BackendThermalState {
    descriptor: BackendDescriptor,
    sample: TelemetrySample,
    consecutive_probe_failures: u32,
    last_update: chrono::DateTime<chrono::Utc>,
}

impl BackendThermalState {
    fn reachable(&self) -> bool {
        self.consecutive_probe_failures < 2
    }

    /// Healthy: temp <= 75% of max, not throttling, reachable.
    /// Degraded: temp in (75%, 90%] of max, or fan >= 80% of max fan.
    /// Unhealthy: temp > 90% of max, throttling, or unreachable.
    fn health(&self) -> ThermalHealth {
        let max_temp = self.descriptor.characteristics.max_temp_celsius;
        let max_fan = self.descriptor.characteristics.max_fan_percent;
        let temp = self.sample.temperature_celsius;

        if !self.reachable() || self.sample.throttling || temp > 0.90 * max_temp {
            return ThermalHealth::Unhealthy;
        }
        let fan_hot = max_fan > 0.0 && self.sample.fan_percent >= 0.80 * max_fan;
        if temp > 0.75 * max_temp || fan_hot {
            return ThermalHealth::Degraded;
        }
        ThermalHealth::Healthy
    }

    fn reading(&self) -> ThermalReading {
        ThermalReading {
            backend_id: self.descriptor.id.clone(),
            temperature_celsius: self.sample.temperature_celsius,
            fan_percent: self.sample.fan_percent,
            throttling: self.sample.throttling,
            power_watts: self.sample.power_watts,
            reachable: self.reachable(),
            health: self.health(),
            last_update: self.last_update,
        }
    }
}

/// Consistent copy of all backends' thermal state at one instant
///
/// The router takes one snapshot per decision so every filter and score
/// within that decision sees the same numbers.
#[derive(Debug, Clone)]
pub struct ThermalSnapshot {
    readings: HashMap<String, ThermalReading>,
    limits: HashMap<String, (f64, f64)>,
}

impl ThermalSnapshot {
    pub fn reading(&self, backend_id: &str) -> Option<&ThermalReading> {
        self.readings.get(backend_id)
    }

    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.readings
            .get(backend_id)
            .map(|r| r.health == ThermalHealth::Healthy)
            .unwrap_or(false)
    }

    /// Whether the active profile permits using this backend right now.
    /// Returns the limiting constraint on rejection.
    pub fn can_use(&self, backend_id: &str, profile: &EfficiencyProfile) -> (bool, String) {
        let Some(reading) = self.readings.get(backend_id) else {
            return (false, format!("no telemetry for {}", backend_id));
        };
        let Some((max_temp, _max_fan)) = self.limits.get(backend_id) else {
            return (false, format!("unknown backend {}", backend_id));
        };

        if !reading.reachable {
            return (false, format!("{} telemetry unreachable", backend_id));
        }
        if reading.throttling {
            return (false, format!("{} is throttling", backend_id));
        }
        if reading.temperature_celsius > *max_temp {
            return (
                false,
                format!(
                    "thermal: {:.1}°C exceeds {} hardware limit {:.0}°C",
                    reading.temperature_celsius, backend_id, max_temp
                ),
            );
        }
        if reading.temperature_celsius > profile.max_temp_celsius {
            return (
                false,
                format!(
                    "thermal: {:.1}°C exceeds {} mode limit {:.0}°C",
                    reading.temperature_celsius, profile.mode, profile.max_temp_celsius
                ),
            );
        }
        if reading.fan_percent > profile.max_fan_percent {
            return (
                false,
                format!(
                    "fan {:.0}% exceeds {} mode cap {:.0}%",
                    reading.fan_percent, profile.mode, profile.max_fan_percent
                ),
            );
        }
        if reading.health == ThermalHealth::Unhealthy {
            return (false, format!("{} is thermally unhealthy", backend_id));
        }
        (true, String::new())
    }

    /// Scorer input: 0.0 for a cold backend rising to 1.0 when the backend
    /// is at its limit, throttling, or unreachable.
    pub fn thermal_penalty(&self, backend_id: &str) -> f64 {
        let Some(reading) = self.readings.get(backend_id) else {
            return 1.0;
        };
        if reading.health == ThermalHealth::Unhealthy {
            return 1.0;
        }
        let Some((max_temp, max_fan)) = self.limits.get(backend_id) else {
            return 1.0;
        };

        let temp_penalty = ((reading.temperature_celsius / max_temp - 0.75) / 0.25)
            .clamp(0.0, 1.0);
        let fan_penalty = if *max_fan > 0.0 {
            ((reading.fan_percent / max_fan - 0.80) / 0.20).clamp(0.0, 1.0)
        } else {
            0.0
        };
        temp_penalty.max(fan_penalty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThermalReading> {
        self.readings.values()
    }
}

/// Process-wide thermal state, fed by the poll loop
#[derive(Debug)]
pub struct ThermalMonitor {
    states: RwLock<HashMap<String, BackendThermalState>>,
    probes: HashMap<String, Arc<dyn TelemetryProbe>>,
    poll_interval: Duration,
}

impl ThermalMonitor {
    pub fn new(
        backends: Vec<(BackendDescriptor, Arc<dyn TelemetryProbe>)>,
        poll_interval: Duration,
    ) -> Self {
        let mut states = HashMap::new();
        let mut probes = HashMap::new();
        for (descriptor, probe) in backends {
            probes.insert(descriptor.id.clone(), probe);
            states.insert(
                descriptor.id.clone(),
                BackendThermalState {
                    descriptor,
                    sample: TelemetrySample::default(),
                    consecutive_probe_failures: 0,
                    last_update: chrono::Utc::now(),
                },
            );
        }
        Self {
            states: RwLock::new(states),
            probes,
            poll_interval,
        }
    }

    /// Poll every backend until cancelled. Probe failures mark the backend
    /// unreachable and polling continues; nothing here crashes the process.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            backends = self.probes.len(),
            "thermal monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("thermal monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    pub async fn poll_once(&self) {
        for (backend_id, probe) in &self.probes {
            match probe.sample().await {
                Ok(sample) => {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(backend_id) {
                        state.sample = sample;
                        state.consecutive_probe_failures = 0;
                        state.last_update = chrono::Utc::now();
                        debug!(
                            backend_id = %backend_id,
                            temp_c = sample.temperature_celsius,
                            fan_pct = sample.fan_percent,
                            "telemetry sample"
                        );
                    }
                }
                Err(error) => {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(backend_id) {
                        state.consecutive_probe_failures =
                            state.consecutive_probe_failures.saturating_add(1);
                        state.last_update = chrono::Utc::now();
                        warn!(
                            backend_id = %backend_id,
                            failures = state.consecutive_probe_failures,
                            %error,
                            "telemetry probe failed"
                        );
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> ThermalSnapshot {
        let states = self.states.read();
        let readings = states
            .iter()
            .map(|(id, state)| (id.clone(), state.reading()))
            .collect();
        let limits = states
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    (
                        state.descriptor.characteristics.max_temp_celsius,
                        state.descriptor.characteristics.max_fan_percent,
                    ),
                )
            })
            .collect();
        ThermalSnapshot { readings, limits }
    }

    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.snapshot().is_healthy(backend_id)
    }

    pub fn can_use(&self, backend_id: &str, profile: &EfficiencyProfile) -> (bool, String) {
        self.snapshot().can_use(backend_id, profile)
    }

    pub fn thermal_penalty(&self, backend_id: &str) -> f64 {
        self.snapshot().thermal_penalty(backend_id)
    }
}
