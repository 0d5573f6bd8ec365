//! Circuit Breaker
//!
//! Prevents cascading failures by automatically detecting failing backends
//! and temporarily stopping requests to them.
//!
//! States:
//! - CLOSED: normal operation
//! - OPEN: failing, reject all requests until the cool-down elapses
//! - HALF_OPEN: admit exactly one probe to test recovery
//!
//! Transitions are strictly monotone within a fault window:
//! closed -> open -> half-open -> closed/open. A failure in half-open
//! re-opens with the cool-down doubled, up to a cap.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds, shared by all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `window` before tripping
    pub failure_threshold: u32,
    /// Sliding window for failure counting
    pub window: Duration,
    /// Initial cool-down after tripping
    pub cooldown: Duration,
    /// Ceiling for the doubled cool-down
    pub cooldown_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(15),
            cooldown_cap: Duration::from_secs(120),
        }
    }
}

/// Emitted on every phase transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub backend_id: String,
    pub from: BreakerPhase,
    pub to: BreakerPhase,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    /// Failure instants inside the sliding window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    /// Whether the single half-open probe slot has been handed out
    probe_in_flight: bool,
}

/// Circuit breaker for one backend
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backend_id: backend_id.into(),
            config,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                current_cooldown: Duration::ZERO,
                probe_in_flight: false,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Current phase, advancing open -> half-open when the cool-down has
    /// elapsed. The router uses this to filter candidates.
    pub async fn phase(&self) -> BreakerPhase {
        let mut state = self.state.lock().await;
        self.advance_cooldown(&mut state);
        state.phase
    }

    /// Whether a request may be sent right now.
    ///
    /// In half-open this reports true only while the probe slot is free;
    /// it does not consume the slot — `acquire` does.
    pub async fn allows_request(&self) -> bool {
        let mut state = self.state.lock().await;
        self.advance_cooldown(&mut state);
        match state.phase {
            BreakerPhase::Closed => true,
            BreakerPhase::Open => false,
            BreakerPhase::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Claim permission to call the backend. In half-open this consumes the
    /// single probe slot; callers must follow up with `record_success` or
    /// `record_failure`.
    pub async fn acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.advance_cooldown(&mut state);
        match state.phase {
            BreakerPhase::Closed => true,
            BreakerPhase::Open => false,
            BreakerPhase::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    debug!(backend_id = %self.backend_id, "admitting half-open probe");
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match state.phase {
            BreakerPhase::Closed => {
                state.failures.clear();
            }
            BreakerPhase::HalfOpen => {
                state.failures.clear();
                state.opened_at = None;
                state.current_cooldown = Duration::ZERO;
                state.probe_in_flight = false;
                self.transition(&mut state, BreakerPhase::Closed);
                info!(backend_id = %self.backend_id, "breaker closed after successful probe");
            }
            // A success report racing a trip; the window logic already
            // decided, keep the open phase.
            BreakerPhase::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.phase {
            BreakerPhase::Closed => {
                state.failures.push_back(now);
                self.prune_window(&mut state, now);
                if state.failures.len() as u32 >= self.config.failure_threshold {
                    state.opened_at = Some(now);
                    state.current_cooldown = self.config.cooldown;
                    self.transition(&mut state, BreakerPhase::Open);
                    warn!(
                        backend_id = %self.backend_id,
                        failures = state.failures.len(),
                        cooldown_s = state.current_cooldown.as_secs(),
                        "breaker tripped"
                    );
                }
            }
            BreakerPhase::HalfOpen => {
                state.opened_at = Some(now);
                state.current_cooldown = (state.current_cooldown * 2)
                    .max(self.config.cooldown)
                    .min(self.config.cooldown_cap);
                state.probe_in_flight = false;
                self.transition(&mut state, BreakerPhase::Open);
                warn!(
                    backend_id = %self.backend_id,
                    cooldown_s = state.current_cooldown.as_secs(),
                    "half-open probe failed, re-opening"
                );
            }
            BreakerPhase::Open => {}
        }
    }

    /// Reset to closed. Test and operator hook.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.failures.clear();
        state.opened_at = None;
        state.current_cooldown = Duration::ZERO;
        state.probe_in_flight = false;
        if state.phase != BreakerPhase::Closed {
            self.transition(&mut state, BreakerPhase::Closed);
        }
    }

    /// Force open. Test and operator hook.
    pub async fn force_open(&self) {
        let mut state = self.state.lock().await;
        state.opened_at = Some(Instant::now());
        if state.current_cooldown == Duration::ZERO {
            state.current_cooldown = self.config.cooldown;
        }
        if state.phase != BreakerPhase::Open {
            self.transition(&mut state, BreakerPhase::Open);
        }
    }

    fn advance_cooldown(&self, state: &mut BreakerState) {
        if state.phase == BreakerPhase::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= state.current_cooldown {
                    state.probe_in_flight = false;
                    self.transition(state, BreakerPhase::HalfOpen);
                    debug!(backend_id = %self.backend_id, "cool-down elapsed, half-open");
                }
            }
        }
    }

    fn prune_window(&self, state: &mut BreakerState, now: Instant) {
        let window = self.config.window;
        while let Some(front) = state.failures.front() {
            if now.duration_since(*front) > window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: BreakerPhase) {
        let from = state.phase;
        state.phase = to;
        let _ = self.events.send(BreakerEvent {
            backend_id: self.backend_id.clone(),
            from,
            to,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// One breaker per backend, created on first use
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn for_backend(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(backend_id, self.config.clone()))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(15),
            cooldown_cap: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        assert_eq!(breaker.phase().await, BreakerPhase::Closed);
        assert!(breaker.allows_request().await);
    }

    #[tokio::test]
    async fn trips_after_threshold_failures() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Open);
        assert!(!breaker.allows_request().await);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_admits_one_probe() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.phase().await, BreakerPhase::Open);

        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(breaker.phase().await, BreakerPhase::HalfOpen);

        assert!(breaker.acquire().await);
        // Second probe rejected while the first is in flight
        assert!(!breaker.acquire().await);

        breaker.record_success().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_doubles_cooldown_up_to_cap() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }

        // First probe fails: cool-down doubles to 30s
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(breaker.acquire().await);
        breaker.record_failure().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Open);

        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(breaker.phase().await, BreakerPhase::Open);
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(breaker.phase().await, BreakerPhase::HalfOpen);

        // Second failed probe: 60s (cap)
        assert!(breaker.acquire().await);
        breaker.record_failure().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.phase().await, BreakerPhase::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires_old_failures() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        // Old failures fell out of the window; this one starts fresh
        breaker.record_failure().await;
        assert_eq!(breaker.phase().await, BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn transitions_emit_events() {
        let breaker = CircuitBreaker::new("ollama-npu", test_config());
        let mut events = breaker.subscribe();
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        let event = events.recv().await.unwrap();
        assert_eq!(event.from, BreakerPhase::Closed);
        assert_eq!(event.to, BreakerPhase::Open);
        assert_eq!(event.backend_id, "ollama-npu");
    }

    #[tokio::test]
    async fn registry_returns_same_breaker_per_backend() {
        let registry = BreakerRegistry::new(test_config());
        let a = registry.for_backend("ollama-npu");
        let b = registry.for_backend("ollama-npu");
        a.record_failure().await;
        a.record_failure().await;
        a.record_failure().await;
        assert_eq!(b.phase().await, BreakerPhase::Open);
    }
}
