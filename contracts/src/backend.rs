//! Backend descriptors and runtime classification

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Accelerator classes present on the host machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareClass {
    /// Neural processing unit, lowest power tier
    Npu,
    /// Integrated GPU sharing system memory
    Igpu,
    /// Discrete GPU, highest capability and power draw
    Dgpu,
    /// CPU fallback
    Cpu,
}

impl HardwareClass {
    pub fn all() -> Vec<HardwareClass> {
        vec![
            HardwareClass::Npu,
            HardwareClass::Igpu,
            HardwareClass::Dgpu,
            HardwareClass::Cpu,
        ]
    }
}

impl Display for HardwareClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HardwareClass::Npu => "npu",
            HardwareClass::Igpu => "igpu",
            HardwareClass::Dgpu => "dgpu",
            HardwareClass::Cpu => "cpu",
        })
    }
}

/// Operations a backend can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextGeneration,
    Embeddings,
    AudioToText,
    TextToAudio,
    ImageToText,
}

/// Nominal characteristics of a backend, configured once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCharacteristics {
    /// Typical power draw under load
    pub nominal_power_watts: f64,
    /// Typical time to complete a moderate generation
    pub nominal_latency_ms: u64,
    /// Fan ceiling the hardware is rated for
    pub max_fan_percent: f64,
    /// Temperature ceiling before the hardware protects itself
    pub max_temp_celsius: f64,
    pub capabilities: Vec<Capability>,
}

/// Immutable description of one execution engine
///
/// Built from configuration at startup and never mutated afterwards. All
/// runtime state lives in the registry, keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Stable identifier, e.g. `ollama-npu`
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub hardware: HardwareClass,
    /// Base URL of the engine's HTTP API
    pub endpoint: String,
    /// Tiebreak preference, higher wins
    pub priority: u32,
    pub characteristics: BackendCharacteristics,
    /// Models this backend can serve; empty means unrestricted
    pub models: Vec<String>,
}

impl BackendDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.characteristics.capabilities.contains(&capability)
    }

    /// Model compatibility by exact or base-name match.
    ///
    /// `llama3` matches a configured `llama3:8b` and vice versa; the tag
    /// after `:` narrows but never widens the family.
    pub fn supports_model(&self, model: &str) -> bool {
        if self.models.is_empty() {
            return true;
        }
        let base = model.split(':').next().unwrap_or(model);
        self.models.iter().any(|m| {
            m.as_str() == model || m.split(':').next().unwrap_or(m.as_str()) == base
        })
    }
}

/// Coarse liveness of a backend as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Up,
    Degraded,
    Down,
}

impl Liveness {
    /// Whether the router may still consider this backend
    pub fn is_routable(&self) -> bool {
        matches!(self, Liveness::Up | Liveness::Degraded)
    }

    /// Gauge encoding for the metrics surface: 1 up, 0.5 degraded, 0 down
    pub fn as_gauge(&self) -> f64 {
        match self {
            Liveness::Up => 1.0,
            Liveness::Degraded => 0.5,
            Liveness::Down => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(models: Vec<&str>) -> BackendDescriptor {
        BackendDescriptor {
            id: "ollama-npu".to_string(),
            name: "NPU engine".to_string(),
            hardware: HardwareClass::Npu,
            endpoint: "http://127.0.0.1:11434".to_string(),
            priority: 10,
            characteristics: BackendCharacteristics {
                nominal_power_watts: 4.0,
                nominal_latency_ms: 300,
                max_fan_percent: 0.0,
                max_temp_celsius: 70.0,
                capabilities: vec![Capability::TextGeneration],
            },
            models: models.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn model_match_by_base_name() {
        let b = descriptor(vec!["llama3:8b", "phi3"]);
        assert!(b.supports_model("llama3"));
        assert!(b.supports_model("llama3:8b"));
        assert!(b.supports_model("phi3:mini"));
        assert!(!b.supports_model("mistral"));
    }

    #[test]
    fn empty_model_list_is_unrestricted() {
        let b = descriptor(vec![]);
        assert!(b.supports_model("anything"));
    }

    #[test]
    fn liveness_gating() {
        assert!(Liveness::Up.is_routable());
        assert!(Liveness::Degraded.is_routable());
        assert!(!Liveness::Down.is_routable());
    }
}
