//! Configuration schema, loading, and validation

use anyhow::{bail, Context, Result};
use inference_fabric_contracts::{
    BackendCharacteristics, BackendDescriptor, Capability, EfficiencyMode, HardwareClass,
};
use inference_fabric_efficiency::{BatteryThresholds, EfficiencyConfig, QuietHours};
use inference_fabric_forwarding::ForwardingConfig;
use inference_fabric_resilience::BreakerConfig;
use inference_fabric_router::ScoringWeights;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub client_ca_file: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            client_ca_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Reserved for an RPC transport fronting the generation service;
    /// parsed for compatibility and reported at startup
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub tls: TlsSettings,
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_http_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            http_port: default_http_port(),
            host: default_host(),
            tls: TlsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightSettings {
    pub latency: f64,
    pub power: f64,
    pub thermal: f64,
    pub queue: f64,
    pub priority: f64,
}

impl From<WeightSettings> for ScoringWeights {
    fn from(weights: WeightSettings) -> Self {
        ScoringWeights {
            latency: weights.latency,
            power: weights.power,
            thermal: weights.thermal,
            queue: weights.queue,
            priority: weights.priority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_true")]
    pub power_aware: bool,
    #[serde(default = "default_true")]
    pub auto_optimize: bool,
    /// Applied when a request carries no deadline of its own
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Overrides the Balanced weight row when present
    #[serde(default)]
    pub scoring_weights: Option<WeightSettings>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            power_aware: true,
            auto_optimize: true,
            default_timeout_secs: default_timeout_secs(),
            scoring_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicsSettings {
    pub nominal_power_watts: f64,
    pub nominal_latency_ms: u64,
    #[serde(default = "default_max_fan")]
    pub max_fan_percent: f64,
    #[serde(default = "default_max_temp")]
    pub max_temp_celsius: f64,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
}

fn default_max_fan() -> f64 {
    100.0
}

fn default_max_temp() -> f64 {
    90.0
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::TextGeneration]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub hardware: HardwareClass,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub endpoint: String,
    #[serde(default)]
    pub priority: u32,
    pub characteristics: CharacteristicsSettings,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
}

fn default_max_in_flight() -> u32 {
    8
}

impl BackendSettings {
    pub fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            hardware: self.hardware,
            endpoint: self.endpoint.clone(),
            priority: self.priority,
            characteristics: BackendCharacteristics {
                nominal_power_watts: self.characteristics.nominal_power_watts,
                nominal_latency_ms: self.characteristics.nominal_latency_ms,
                max_fan_percent: self.characteristics.max_fan_percent,
                max_temp_celsius: self.characteristics.max_temp_celsius,
                capabilities: self.characteristics.capabilities.clone(),
            },
            models: self.models.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursSettings {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryThresholdSettings {
    pub critical: f64,
    pub low: f64,
    pub conservative: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EfficiencySettings {
    #[serde(default = "default_mode")]
    pub default_mode: String,
    #[serde(default)]
    pub quiet_hours: Option<QuietHoursSettings>,
    #[serde(default)]
    pub battery_thresholds: Option<BatteryThresholdSettings>,
}

fn default_mode() -> String {
    "balanced".to_string()
}

impl Default for EfficiencySettings {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            quiet_hours: None,
            battery_thresholds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<HardwareClass>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_ladder() -> Vec<HardwareClass> {
    vec![HardwareClass::Npu, HardwareClass::Igpu, HardwareClass::Dgpu]
}

fn default_min_confidence() -> f64 {
    0.6
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ladder: default_ladder(),
            min_confidence: default_min_confidence(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    15
}

fn default_cooldown_cap_secs() -> u64 {
    120
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_cap_secs: default_cooldown_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_rps() -> u32 {
    50
}

fn default_burst() -> u32 {
    100
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSettings {
    /// Empty list disables authentication
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub mtls_required: bool,
}

/// The whole configuration tree
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabricConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub backends: Vec<BackendSettings>,
    #[serde(default)]
    pub efficiency: EfficiencySettings,
    #[serde(default)]
    pub forwarding: ForwardingSettings,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub auth: AuthSettings,
}

impl FabricConfig {
    /// Load from a TOML file, apply `FABRIC__*` environment overrides,
    /// and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("FABRIC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;
        let parsed: FabricConfig = settings
            .try_deserialize()
            .context("deserializing configuration")?;
        parsed.validate()?;
        info!(
            backends = parsed.backends.len(),
            http_port = parsed.server.http_port,
            "configuration loaded"
        );
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            bail!("server.http_port must be non-zero");
        }
        if self.server.tls.enabled
            && (self.server.tls.cert_file.is_none() || self.server.tls.key_file.is_none())
        {
            bail!("server.tls requires cert_file and key_file when enabled");
        }

        if self.enabled_backends().next().is_none() {
            bail!("at least one enabled backend is required");
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                bail!("backend ids must be non-empty");
            }
            if !seen.insert(&backend.id) {
                bail!("duplicate backend id '{}'", backend.id);
            }
            if !backend.endpoint.starts_with("http://")
                && !backend.endpoint.starts_with("https://")
            {
                bail!(
                    "backend '{}' endpoint must be an http(s) URL, got '{}'",
                    backend.id,
                    backend.endpoint
                );
            }
            let characteristics = &backend.characteristics;
            if characteristics.nominal_power_watts <= 0.0 {
                bail!("backend '{}' nominal power must be positive", backend.id);
            }
            if characteristics.nominal_latency_ms == 0 {
                bail!("backend '{}' nominal latency must be positive", backend.id);
            }
            if characteristics.max_temp_celsius <= 0.0 {
                bail!("backend '{}' max temperature must be positive", backend.id);
            }
            if characteristics.capabilities.is_empty() {
                bail!("backend '{}' declares no capabilities", backend.id);
            }
            if backend.max_in_flight == 0 {
                bail!("backend '{}' max_in_flight must be positive", backend.id);
            }
        }

        self.efficiency
            .default_mode
            .parse::<EfficiencyMode>()
            .map_err(|e| anyhow::anyhow!("efficiency.default_mode: {}", e))?;
        if let Some(quiet_hours) = &self.efficiency.quiet_hours {
            if quiet_hours.start >= 24 || quiet_hours.end >= 24 {
                bail!("efficiency.quiet_hours must use hours 0-23");
            }
        }
        if let Some(thresholds) = &self.efficiency.battery_thresholds {
            if thresholds.critical >= thresholds.low {
                bail!("battery_thresholds.critical must be below low");
            }
            if thresholds.low >= thresholds.conservative {
                bail!("battery_thresholds.low must be below conservative");
            }
        }

        if self.forwarding.enabled {
            if self.forwarding.ladder.is_empty() {
                bail!("forwarding.ladder must not be empty when forwarding is enabled");
            }
            if !(0.0..=1.0).contains(&self.forwarding.min_confidence) {
                bail!("forwarding.min_confidence must be in [0, 1]");
            }
        }

        if let Some(weights) = &self.router.scoring_weights {
            let parts = [
                weights.latency,
                weights.power,
                weights.thermal,
                weights.queue,
                weights.priority,
            ];
            if parts.iter().any(|w| *w < 0.0) {
                bail!("router.scoring_weights must be non-negative");
            }
            if parts.iter().sum::<f64>() <= 0.0 {
                bail!("router.scoring_weights must not all be zero");
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be positive");
        }
        if self.ratelimit.requests_per_second == 0 {
            bail!("ratelimit.requests_per_second must be positive");
        }
        Ok(())
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendSettings> {
        self.backends.iter().filter(|backend| backend.enabled)
    }

    pub fn efficiency_config(&self) -> Result<EfficiencyConfig> {
        Ok(EfficiencyConfig {
            default_mode: self.efficiency.default_mode.parse().map_err(|e| {
                anyhow::anyhow!("efficiency.default_mode: {}", e)
            })?,
            quiet_hours: self
                .efficiency
                .quiet_hours
                .as_ref()
                .map(|hours| QuietHours {
                    start: hours.start,
                    end: hours.end,
                })
                .unwrap_or_default(),
            battery_thresholds: self
                .efficiency
                .battery_thresholds
                .as_ref()
                .map(|thresholds| BatteryThresholds {
                    critical: thresholds.critical,
                    low: thresholds.low,
                    conservative: thresholds.conservative,
                })
                .unwrap_or_default(),
            tick_interval: Duration::from_secs(10),
        })
    }

    pub fn forwarding_config(&self) -> ForwardingConfig {
        ForwardingConfig {
            enabled: self.forwarding.enabled,
            ladder: self.forwarding.ladder.clone(),
            min_confidence: self.forwarding.min_confidence,
            max_attempts: self
                .forwarding
                .max_attempts
                .unwrap_or(self.forwarding.ladder.len()),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            window: Duration::from_secs(self.circuit_breaker.window_secs),
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
            cooldown_cap: Duration::from_secs(self.circuit_breaker.cooldown_cap_secs),
        }
    }
}
