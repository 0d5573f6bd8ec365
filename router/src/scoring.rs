//! Candidate scoring
//!
//! score(b) = w_latency * latency_fit
//!          + w_power   * power_fit
//!          + w_thermal * (1 - thermal_penalty)
//!          + w_queue   * (1 - queue_fraction)
//!          + w_priority * priority / max_priority
//!
//! Weight sets come from the active profile: Performance chases latency,
//! Efficiency and UltraEfficiency chase power, Quiet leans on the thermal
//! term (which already prices fan pressure in).

use inference_fabric_contracts::{EfficiencyMode, EfficiencyProfile};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub latency: f64,
    pub power: f64,
    pub thermal: f64,
    pub queue: f64,
    pub priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        // Balanced row
        Self {
            latency: 0.30,
            power: 0.25,
            thermal: 0.20,
            queue: 0.15,
            priority: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn for_mode(mode: EfficiencyMode) -> Self {
        match mode {
            EfficiencyMode::Performance => Self {
                latency: 0.55,
                power: 0.05,
                thermal: 0.15,
                queue: 0.15,
                priority: 0.10,
            },
            EfficiencyMode::Balanced | EfficiencyMode::Auto => Self::default(),
            // Power-first modes ignore latency entirely; the priority
            // term then prefers the cheapest tier among equals.
            EfficiencyMode::Efficiency => Self {
                latency: 0.0,
                power: 0.45,
                thermal: 0.25,
                queue: 0.15,
                priority: 0.15,
            },
            EfficiencyMode::Quiet => Self {
                latency: 0.10,
                power: 0.30,
                thermal: 0.35,
                queue: 0.15,
                priority: 0.10,
            },
            EfficiencyMode::UltraEfficiency => Self {
                latency: 0.0,
                power: 0.50,
                thermal: 0.25,
                queue: 0.10,
                priority: 0.15,
            },
        }
    }

    /// A caller asking for power efficiency shifts weight from latency
    /// to power without changing the profile.
    pub fn with_power_preference(mut self) -> Self {
        let shift = (self.latency * 0.5).min(0.2);
        self.latency -= shift;
        self.power += shift;
        self
    }

    /// An honored latency-critical flag shifts weight the other way
    pub fn with_latency_preference(mut self) -> Self {
        let shift = (self.power * 0.5).min(0.2);
        self.power -= shift;
        self.latency += shift;
        self
    }
}

/// Latency fit in [0, 1].
///
/// With a caller deadline: how much headroom the backend's nominal
/// latency leaves under it. Without one: 1.0 for the fastest candidate,
/// decreasing linearly to 0.0 for the slowest.
pub fn latency_fit(
    nominal_latency_ms: u64,
    max_latency_ms: Option<u64>,
    fastest_ms: u64,
    slowest_ms: u64,
) -> f64 {
    match max_latency_ms {
        Some(max) if max > 0 => {
            (1.0 - nominal_latency_ms as f64 / max as f64).clamp(0.0, 1.0)
        }
        _ => {
            if slowest_ms <= fastest_ms {
                1.0
            } else {
                let span = (slowest_ms - fastest_ms) as f64;
                1.0 - (nominal_latency_ms.saturating_sub(fastest_ms)) as f64 / span
            }
        }
    }
}

/// Binary power fit against the profile cap
pub fn power_fit(nominal_power_watts: f64, profile: &EfficiencyProfile) -> f64 {
    if profile.permits_power(nominal_power_watts) {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_latency_fit_has_headroom_semantics() {
        assert_eq!(latency_fit(100, Some(1000), 0, 0), 0.9);
        assert_eq!(latency_fit(1000, Some(1000), 0, 0), 0.0);
        assert_eq!(latency_fit(2000, Some(1000), 0, 0), 0.0);
    }

    #[test]
    fn relative_latency_fit_ranks_candidates() {
        // fastest 100ms, slowest 500ms
        assert_eq!(latency_fit(100, None, 100, 500), 1.0);
        assert_eq!(latency_fit(500, None, 100, 500), 0.0);
        assert_eq!(latency_fit(300, None, 100, 500), 0.5);
    }

    #[test]
    fn single_candidate_gets_full_fit() {
        assert_eq!(latency_fit(400, None, 400, 400), 1.0);
    }

    #[test]
    fn power_fit_is_binary_on_cap() {
        let profile =
            EfficiencyProfile::for_mode(EfficiencyMode::Efficiency).unwrap();
        assert_eq!(power_fit(14.9, &profile), 1.0);
        assert_eq!(power_fit(15.1, &profile), 0.0);
        let unlimited =
            EfficiencyProfile::for_mode(EfficiencyMode::Performance).unwrap();
        assert_eq!(power_fit(400.0, &unlimited), 1.0);
    }

    #[test]
    fn mode_weights_emphasize_their_concern() {
        let performance = ScoringWeights::for_mode(EfficiencyMode::Performance);
        let efficiency = ScoringWeights::for_mode(EfficiencyMode::Efficiency);
        assert!(performance.latency > efficiency.latency);
        assert!(efficiency.power > performance.power);
        let quiet = ScoringWeights::for_mode(EfficiencyMode::Quiet);
        assert!(quiet.thermal > performance.thermal);
    }

    #[test]
    fn power_preference_shifts_weight() {
        let base = ScoringWeights::default();
        let shifted = base.with_power_preference();
        assert!(shifted.power > base.power);
        assert!(shifted.latency < base.latency);
        let total: f64 = shifted.latency + shifted.power + shifted.thermal
            + shifted.queue + shifted.priority;
        assert!((total - 1.0).abs() < 1e-9);
    }
}
