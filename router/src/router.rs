//! The decision engine
//!
//! One call, one decision: snapshot the active profile and thermal state,
//! filter the pool down to candidates, score the survivors, and return
//! the winner with full provenance. The router holds no per-request
//! state and is safe to call concurrently.

use crate::classifier::{classify, ComplexityTier};
use crate::scoring::{latency_fit, power_fit, ScoringWeights};
use crate::workload::{detect_workload, WorkloadClass};
use inference_fabric_contracts::{
    Capability, EfficiencyMode, HardwareClass, RequestAnnotations, RouterError,
    RoutingDecision,
};
use inference_fabric_efficiency::EfficiencyManager;
use inference_fabric_registry::{BackendEntry, BackendRegistry};
use inference_fabric_resilience::BreakerRegistry;
use inference_fabric_thermal::ThermalMonitor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What the router needs to know about one request
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub model: String,
    pub prompt: String,
    pub capability: Capability,
    pub annotations: RequestAnnotations,
    /// Ladder restriction: only consider this hardware tier
    pub restrict_hardware: Option<HardwareClass>,
    /// Backends already attempted in this request
    pub exclude_backends: Vec<String>,
}

impl RouteRequest {
    pub fn text_generation(
        model: impl Into<String>,
        prompt: impl Into<String>,
        annotations: RequestAnnotations,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            capability: Capability::TextGeneration,
            annotations,
            restrict_hardware: None,
            exclude_backends: Vec::new(),
        }
    }
}

struct Candidate {
    entry: Arc<BackendEntry>,
    thermal_penalty: f64,
}

pub struct Router {
    registry: Arc<BackendRegistry>,
    thermal: Arc<ThermalMonitor>,
    efficiency: Arc<EfficiencyManager>,
    breakers: Arc<BreakerRegistry>,
    /// Configured replacement for the Balanced weight row
    balanced_weights: Option<ScoringWeights>,
    decision_counts: RwLock<HashMap<String, u64>>,
}

impl Router {
    pub fn new(
        registry: Arc<BackendRegistry>,
        thermal: Arc<ThermalMonitor>,
        efficiency: Arc<EfficiencyManager>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            thermal,
            efficiency,
            breakers,
            balanced_weights: None,
            decision_counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_balanced_weights(mut self, weights: ScoringWeights) -> Self {
        self.balanced_weights = Some(weights);
        self
    }

    /// Per-backend decision counts for the metrics surface
    pub fn decision_counts(&self) -> HashMap<String, u64> {
        self.decision_counts.read().clone()
    }

    /// Pick one backend for this request, or explain why none fits
    pub async fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, RouterError> {
        // One profile and one thermal snapshot for the whole decision
        let profile = self.efficiency.active_profile();
        let thermal = self.thermal.snapshot();

        let tier = classify(&request.prompt, &request.model);
        let annotations = &request.annotations;
        let workload = detect_workload(annotations, &request.model);

        // The caller's critical flag is demoted when the active policy may
        // override and the classifier's tier for this request does not
        // justify it. One classification verdict drives both scoring and
        // demotion.
        let critical_demoted = annotations.latency_critical
            && profile.allow_override_critical
            && tier == ComplexityTier::Simple;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut exclusions: Vec<(String, String)> = Vec::new();

        for entry in self.registry.snapshot() {
            let id = entry.descriptor.id.clone();
            if request.exclude_backends.contains(&id) {
                continue;
            }
            if let Some(hardware) = request.restrict_hardware {
                if entry.descriptor.hardware != hardware {
                    continue;
                }
            }
            if !entry.liveness().is_routable() {
                exclusions.push((id, "backend down".to_string()));
                continue;
            }
            if !entry.descriptor.supports(request.capability) {
                exclusions.push((id, format!("no {:?} capability", request.capability)));
                continue;
            }
            if !entry.descriptor.supports_model(&request.model) {
                exclusions.push((id, format!("model {} not served", request.model)));
                continue;
            }
            // Thermal limits are checked before policy so exclusion
            // reasons name the physical constraint when both apply
            let (usable, reason) = thermal.can_use(&id, &profile);
            if !usable {
                exclusions.push((id, reason));
                continue;
            }
            if !profile.allows_hardware(entry.descriptor.hardware) {
                exclusions.push((
                    id,
                    format!(
                        "hardware {} not allowed in {} mode{}",
                        entry.descriptor.hardware,
                        profile.mode,
                        profile
                            .max_power_watts
                            .map(|w| format!(" (power cap {:.0}W)", w))
                            .unwrap_or_default()
                    ),
                ));
                continue;
            }
            if let Some(cap) = annotations.max_power_watts {
                if entry.descriptor.characteristics.nominal_power_watts > cap {
                    exclusions.push((
                        id,
                        format!(
                            "nominal {:.0}W exceeds request cap {:.0}W",
                            entry.descriptor.characteristics.nominal_power_watts, cap
                        ),
                    ));
                    continue;
                }
            }
            if !self.breakers.for_backend(&id).allows_request().await {
                exclusions.push((id, "circuit breaker open".to_string()));
                continue;
            }
            let thermal_penalty = thermal.thermal_penalty(&id);
            candidates.push(Candidate {
                entry,
                thermal_penalty,
            });
        }

        // The caller's critical preference, once demoted, must not pull the
        // request onto a backend outside the mode's power envelope when a
        // compliant candidate exists.
        if critical_demoted {
            let within_cap: Vec<_> = candidates
                .iter()
                .map(|c| {
                    profile.permits_power(c.entry.descriptor.characteristics.nominal_power_watts)
                })
                .collect();
            if within_cap.iter().any(|ok| *ok) {
                let mut keep = within_cap.into_iter();
                candidates.retain(|_| keep.next().unwrap_or(false));
            }
        }

        if candidates.is_empty() {
            return Err(self.no_candidate(&profile.mode.to_string(), &exclusions));
        }

        // Explicit target handling
        let mut demoted_target: Option<String> = None;
        let mut target_exclusion: Option<(String, String)> = None;
        if let Some(target) = annotations.target.as_deref() {
            let in_candidates = candidates
                .iter()
                .any(|c| c.entry.descriptor.id == target);
            if in_candidates {
                if critical_demoted {
                    // Target becomes a hint; scoring decides
                    demoted_target = Some(target.to_string());
                } else {
                    let candidate = candidates
                        .iter()
                        .find(|c| c.entry.descriptor.id == target)
                        .expect("membership just checked");
                    let alternatives: Vec<String> = candidates
                        .iter()
                        .filter(|c| c.entry.descriptor.id != target)
                        .take(2)
                        .map(|c| c.entry.descriptor.id.clone())
                        .collect();
                    return Ok(self.decide(
                        request,
                        &profile,
                        candidate,
                        alternatives,
                        &exclusions,
                        None,
                        false,
                    ));
                }
            } else {
                let reason = exclusions
                    .iter()
                    .find(|(id, _)| id == target)
                    .map(|(_, reason)| reason.clone());
                let reason = match reason {
                    Some(reason) => reason,
                    None if self.registry.get(target).is_none() => {
                        return Err(RouterError::InvalidAnnotation {
                            message: format!("unknown target backend '{}'", target),
                        });
                    }
                    // Skipped by a ladder restriction or a prior attempt;
                    // the target stays a hint for this attempt
                    None => "outside this attempt's candidate set".to_string(),
                };
                let profile_filtered = reason.contains("not allowed in");
                if profile_filtered && !profile.allow_override_critical {
                    let suggestion = candidates
                        .first()
                        .map(|c| c.entry.descriptor.id.clone())
                        .unwrap_or_default();
                    return Err(RouterError::ProfileDisallowedTarget {
                        target: target.to_string(),
                        mode: profile.mode,
                        suggestion: format!("try '{}' or change the mode", suggestion),
                    });
                }
                target_exclusion = Some((target.to_string(), reason));
            }
        }

        // Score the survivors
        let fastest = candidates
            .iter()
            .map(|c| c.entry.descriptor.characteristics.nominal_latency_ms)
            .min()
            .unwrap_or(0);
        let slowest = candidates
            .iter()
            .map(|c| c.entry.descriptor.characteristics.nominal_latency_ms)
            .max()
            .unwrap_or(0);
        let max_priority = candidates
            .iter()
            .map(|c| c.entry.descriptor.priority)
            .max()
            .unwrap_or(1)
            .max(1);

        let mut weights = match (profile.mode, self.balanced_weights) {
            (EfficiencyMode::Balanced | EfficiencyMode::Auto, Some(weights)) => weights,
            (mode, _) => ScoringWeights::for_mode(mode),
        };
        if annotations.power_efficient {
            weights = weights.with_power_preference();
        }
        if annotations.latency_critical && !critical_demoted {
            weights = weights.with_latency_preference();
        }
        // Realtime media cannot wait on a power-optimal backend
        if workload == WorkloadClass::Realtime {
            weights = weights.with_latency_preference();
        }

        let mut scored: Vec<(f64, &Candidate)> = candidates
            .iter()
            .map(|candidate| {
                let characteristics = &candidate.entry.descriptor.characteristics;
                let score = weights.latency
                    * latency_fit(
                        characteristics.nominal_latency_ms,
                        annotations.max_latency_ms,
                        fastest,
                        slowest,
                    )
                    + weights.power * power_fit(characteristics.nominal_power_watts, &profile)
                    + weights.thermal * (1.0 - candidate.thermal_penalty)
                    + weights.queue * (1.0 - candidate.entry.queue_fraction())
                    + weights.priority
                        * (candidate.entry.descriptor.priority as f64 / max_priority as f64);
                (score, candidate)
            })
            .collect();

        // Argmax with a stable tiebreak: priority, then id lex order
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.entry.descriptor.priority.cmp(&a.1.entry.descriptor.priority))
                .then_with(|| a.1.entry.descriptor.id.cmp(&b.1.entry.descriptor.id))
        });

        let (score, winner) = scored[0];
        debug!(
            backend_id = %winner.entry.descriptor.id,
            score,
            tier = ?tier,
            workload = ?workload,
            mode = %profile.mode,
            "routing decision"
        );

        let critical_override = critical_demoted
            && (annotations.target.is_none()
                || demoted_target
                    .as_deref()
                    .map(|t| t != winner.entry.descriptor.id)
                    .unwrap_or(true));
        // Runners-up in score order
        let alternatives: Vec<String> = scored
            .iter()
            .skip(1)
            .take(2)
            .map(|(_, candidate)| candidate.entry.descriptor.id.clone())
            .collect();
        let decision = self.decide(
            request,
            &profile,
            winner,
            alternatives,
            &exclusions,
            target_exclusion,
            critical_override,
        );
        Ok(decision)
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        request: &RouteRequest,
        profile: &inference_fabric_contracts::EfficiencyProfile,
        winner: &Candidate,
        alternatives: Vec<String>,
        exclusions: &[(String, String)],
        target_exclusion: Option<(String, String)>,
        critical_override: bool,
    ) -> RoutingDecision {
        let chosen = &winner.entry.descriptor;
        let requested = request.annotations.target.clone();

        let mut reason = format!("selected {} in {} mode", chosen.id, profile.mode);
        if let Some(cap) = profile.max_power_watts {
            reason.push_str(&format!(" (power cap {:.0}W)", cap));
        }
        if let Some(origin) = &profile.origin {
            reason.push_str(&format!(", {}", origin));
        }
        if !exclusions.is_empty() {
            let summary: Vec<String> = exclusions
                .iter()
                .take(3)
                .map(|(id, why)| format!("{}: {}", id, why))
                .collect();
            reason.push_str(&format!("; excluded [{}]", summary.join("; ")));
        }

        let override_applied = requested
            .as_deref()
            .map(|target| target != chosen.id)
            .unwrap_or(false)
            || critical_override;

        let override_reason = if override_applied {
            let mut parts: Vec<String> = Vec::new();
            if let Some((target, why)) = &target_exclusion {
                parts.push(format!("requested {} excluded: {}", target, why));
            } else if requested.as_deref().map(|t| t != chosen.id).unwrap_or(false) {
                parts.push(format!(
                    "requested {} outscored under {} policy",
                    requested.as_deref().unwrap_or_default(),
                    profile.mode
                ));
            }
            if critical_override {
                parts.push(
                    "latency-critical flag unjustified for a simple prompt".to_string(),
                );
            }
            if let Some(origin) = &profile.origin {
                parts.push(origin.clone());
            }
            Some(parts.join("; "))
        } else {
            None
        };

        *self
            .decision_counts
            .write()
            .entry(chosen.id.clone())
            .or_insert(0) += 1;

        info!(
            backend_id = %chosen.id,
            override_applied,
            requested = requested.as_deref().unwrap_or("-"),
            "routed request"
        );

        RoutingDecision {
            backend_id: chosen.id.clone(),
            reason,
            estimated_latency_ms: chosen.characteristics.nominal_latency_ms,
            estimated_power_watts: chosen.characteristics.nominal_power_watts,
            alternatives,
            override_applied,
            override_reason,
            requested: requested.filter(|t| *t != chosen.id),
        }
    }

    fn no_candidate(&self, mode: &str, exclusions: &[(String, String)]) -> RouterError {
        let detail = if exclusions.is_empty() {
            "no backends registered for this capability".to_string()
        } else {
            exclusions
                .iter()
                .take(4)
                .map(|(id, why)| format!("{}: {}", id, why))
                .collect::<Vec<_>>()
                .join("; ")
        };
        RouterError::NoCandidate {
            reason: format!("{} mode left no candidates ({})", mode, detail),
        }
    }
}
