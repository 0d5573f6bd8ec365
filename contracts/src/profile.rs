//! Efficiency modes and the profiles they resolve to

use crate::backend::HardwareClass;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Machine-wide efficiency modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EfficiencyMode {
    Performance,
    Balanced,
    Efficiency,
    Quiet,
    /// Derives one of the concrete modes from battery and clock state
    Auto,
    UltraEfficiency,
}

impl EfficiencyMode {
    pub fn all() -> Vec<EfficiencyMode> {
        vec![
            EfficiencyMode::Performance,
            EfficiencyMode::Balanced,
            EfficiencyMode::Efficiency,
            EfficiencyMode::Quiet,
            EfficiencyMode::Auto,
            EfficiencyMode::UltraEfficiency,
        ]
    }
}

impl Display for EfficiencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EfficiencyMode::Performance => "performance",
            EfficiencyMode::Balanced => "balanced",
            EfficiencyMode::Efficiency => "efficiency",
            EfficiencyMode::Quiet => "quiet",
            EfficiencyMode::Auto => "auto",
            EfficiencyMode::UltraEfficiency => "ultra-efficiency",
        })
    }
}

impl std::str::FromStr for EfficiencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(EfficiencyMode::Performance),
            "balanced" => Ok(EfficiencyMode::Balanced),
            "efficiency" => Ok(EfficiencyMode::Efficiency),
            "quiet" => Ok(EfficiencyMode::Quiet),
            "auto" => Ok(EfficiencyMode::Auto),
            "ultra-efficiency" | "ultraefficiency" => Ok(EfficiencyMode::UltraEfficiency),
            other => Err(format!("unknown efficiency mode: {}", other)),
        }
    }
}

/// Immutable limits active during a routing decision
///
/// Replaced atomically on mode change; a decision holds one snapshot from
/// start to finish and never observes a partially-updated profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyProfile {
    pub mode: EfficiencyMode,
    /// None means unlimited
    pub max_power_watts: Option<f64>,
    pub max_fan_percent: f64,
    pub max_temp_celsius: f64,
    pub allowed_hardware: Vec<HardwareClass>,
    /// Whether policy may override a caller's explicit target or critical flag
    pub allow_override_critical: bool,
    /// What derived this profile when the requested mode was Auto,
    /// e.g. `auto: battery 15% (critical)`; None for explicit modes
    #[serde(default)]
    pub origin: Option<String>,
}

impl EfficiencyProfile {
    /// The fixed profile table. `Auto` has no row here; the efficiency
    /// manager resolves it to a concrete mode first.
    pub fn for_mode(mode: EfficiencyMode) -> Option<EfficiencyProfile> {
        match mode {
            EfficiencyMode::Performance => Some(EfficiencyProfile {
                mode,
                max_power_watts: None,
                max_fan_percent: 100.0,
                max_temp_celsius: 95.0,
                allowed_hardware: HardwareClass::all(),
                allow_override_critical: false,
                origin: None,
            }),
            EfficiencyMode::Balanced => Some(EfficiencyProfile {
                mode,
                max_power_watts: Some(30.0),
                max_fan_percent: 70.0,
                max_temp_celsius: 85.0,
                allowed_hardware: HardwareClass::all(),
                allow_override_critical: true,
                origin: None,
            }),
            EfficiencyMode::Efficiency => Some(EfficiencyProfile {
                mode,
                max_power_watts: Some(15.0),
                max_fan_percent: 60.0,
                max_temp_celsius: 80.0,
                allowed_hardware: vec![HardwareClass::Npu, HardwareClass::Igpu],
                allow_override_critical: true,
                origin: None,
            }),
            EfficiencyMode::Quiet => Some(EfficiencyProfile {
                mode,
                max_power_watts: Some(20.0),
                max_fan_percent: 40.0,
                max_temp_celsius: 75.0,
                allowed_hardware: vec![HardwareClass::Npu, HardwareClass::Igpu],
                allow_override_critical: true,
                origin: None,
            }),
            EfficiencyMode::UltraEfficiency => Some(EfficiencyProfile {
                mode,
                max_power_watts: Some(5.0),
                max_fan_percent: 0.0,
                max_temp_celsius: 70.0,
                allowed_hardware: vec![HardwareClass::Npu],
                allow_override_critical: true,
                origin: None,
            }),
            EfficiencyMode::Auto => None,
        }
    }

    pub fn allows_hardware(&self, hardware: HardwareClass) -> bool {
        self.allowed_hardware.contains(&hardware)
    }

    pub fn permits_power(&self, nominal_power_watts: f64) -> bool {
        match self.max_power_watts {
            Some(cap) => nominal_power_watts <= cap,
            None => true,
        }
    }
}
