//! Pool membership and per-backend runtime state

use crate::adapter::BackendAdapter;
use inference_fabric_contracts::{BackendDescriptor, Liveness, RouterError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Cap used to normalize queue depth into [0, 1] for the scorer
pub const QUEUE_DEPTH_CAP: u32 = 16;

/// Mutable, lock-guarded bits of one backend
#[derive(Debug)]
struct RuntimeState {
    liveness: Liveness,
    consecutive_failures: u32,
}

/// One pool member: immutable descriptor plus guarded runtime state
///
/// Counters use atomics so the hot path never takes the membership lock;
/// liveness sits behind its own mutex.
#[derive(Debug)]
pub struct BackendEntry {
    pub descriptor: BackendDescriptor,
    adapter: Arc<dyn BackendAdapter>,
    runtime: Mutex<RuntimeState>,
    in_flight: AtomicU32,
    queue_depth: AtomicU32,
    max_in_flight: u32,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl BackendEntry {
    pub fn adapter(&self) -> Arc<dyn BackendAdapter> {
        self.adapter.clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.runtime.lock().liveness
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        let mut runtime = self.runtime.lock();
        if runtime.liveness != liveness {
            info!(
                backend_id = %self.descriptor.id,
                from = ?runtime.liveness,
                to = ?liveness,
                "backend liveness changed"
            );
        }
        runtime.liveness = liveness;
    }

    pub fn record_failure(&self) -> u32 {
        let mut runtime = self.runtime.lock();
        runtime.consecutive_failures = runtime.consecutive_failures.saturating_add(1);
        if runtime.consecutive_failures >= 3 && runtime.liveness == Liveness::Up {
            runtime.liveness = Liveness::Degraded;
        }
        runtime.consecutive_failures
    }

    pub fn record_success(&self) {
        let mut runtime = self.runtime.lock();
        runtime.consecutive_failures = 0;
        if runtime.liveness == Liveness::Degraded {
            runtime.liveness = Liveness::Up;
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    /// Queue pressure in [0, 1] for the scorer
    pub fn queue_fraction(&self) -> f64 {
        let waiting = self.queue_depth() + self.in_flight();
        (waiting as f64 / QUEUE_DEPTH_CAP as f64).clamp(0.0, 1.0)
    }
}

/// Releases the in-flight slot when dropped, whatever path the request
/// took out of scope.
#[derive(Debug)]
pub struct InFlightGuard {
    entry: Arc<BackendEntry>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // Underflow would wrap; this is an invariant violation
            self.entry.in_flight.store(0, Ordering::Release);
            warn!(
                backend_id = %self.entry.descriptor.id,
                "in-flight counter underflow"
            );
        }
    }
}

/// The backend pool
///
/// Membership changes only at startup; a single RW lock guards the map
/// while per-backend state uses its own locks and atomics.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    members: RwLock<HashMap<String, Arc<BackendEntry>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        descriptor: BackendDescriptor,
        adapter: Arc<dyn BackendAdapter>,
        max_in_flight: u32,
    ) {
        let id = descriptor.id.clone();
        let entry = Arc::new(BackendEntry {
            descriptor,
            adapter,
            runtime: Mutex::new(RuntimeState {
                liveness: Liveness::Down,
                consecutive_failures: 0,
            }),
            in_flight: AtomicU32::new(0),
            queue_depth: AtomicU32::new(0),
            max_in_flight,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_in_flight as usize)),
        });
        info!(backend_id = %id, max_in_flight, "backend registered");
        self.members.write().insert(id, entry);
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<BackendEntry>> {
        self.members.read().get(backend_id).cloned()
    }

    /// Membership snapshot; holders never keep the map lock
    pub fn snapshot(&self) -> Vec<Arc<BackendEntry>> {
        let mut entries: Vec<_> = self.members.read().values().cloned().collect();
        entries.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Readiness: at least one backend is up or degraded
    pub fn any_routable(&self) -> bool {
        self.members
            .read()
            .values()
            .any(|entry| entry.liveness().is_routable())
    }

    /// Claim an execution slot on a backend. Waits on the per-backend
    /// semaphore when the in-flight cap is reached; the returned guard
    /// releases the slot on drop.
    pub async fn begin_request(&self, backend_id: &str) -> Result<InFlightGuard, RouterError> {
        let entry = self
            .get(backend_id)
            .ok_or_else(|| RouterError::InternalInvariant {
                message: format!("decision chose unregistered backend {}", backend_id),
            })?;

        entry.queue_depth.fetch_add(1, Ordering::AcqRel);
        let permit = entry
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RouterError::Cancelled);
        entry.queue_depth.fetch_sub(1, Ordering::AcqRel);
        let permit = permit?;

        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(InFlightGuard {
            entry,
            _permit: permit,
        })
    }

    /// Initial liveness sweep: ping every adapter once and mark the pool.
    /// `/readyz` stays unready until at least one ping succeeds.
    pub async fn warm_up(&self) {
        for entry in self.snapshot() {
            let adapter = entry.adapter();
            match adapter.ping().await {
                Ok(()) => entry.set_liveness(Liveness::Up),
                Err(error) => {
                    warn!(
                        backend_id = %entry.descriptor.id,
                        %error,
                        "startup ping failed"
                    );
                    entry.set_liveness(Liveness::Down);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterError, AdapterModel, AdapterResponse, BackendAdapter,
    };
    use async_trait::async_trait;
    use inference_fabric_contracts::{
        BackendCharacteristics, Capability, GenerateRequest, HardwareClass, StreamChunk,
    };
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct NullAdapter {
        id: String,
        reachable: bool,
    }

    #[async_trait]
    impl BackendAdapter for NullAdapter {
        fn backend_id(&self) -> &str {
            &self.id
        }

        async fn generate(
            &self,
            _request: &GenerateRequest,
        ) -> Result<AdapterResponse, AdapterError> {
            Ok(AdapterResponse {
                text: "ok".to_string(),
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
            _inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, AdapterError> {
            Err(AdapterError::Unsupported("embed".to_string()))
        }

        async fn list_models(&self) -> Result<Vec<AdapterModel>, AdapterError> {
            Ok(vec![])
        }

        async fn ping(&self) -> Result<(), AdapterError> {
            if self.reachable {
                Ok(())
            } else {
                Err(AdapterError::Transient("connection refused".to_string()))
            }
        }

        fn supports(&self, capability: Capability) -> bool {
            capability == Capability::TextGeneration
        }
    }

    fn descriptor(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            hardware: HardwareClass::Npu,
            endpoint: "http://127.0.0.1:11434".to_string(),
            priority: 1,
            characteristics: BackendCharacteristics {
                nominal_power_watts: 4.0,
                nominal_latency_ms: 200,
                max_fan_percent: 0.0,
                max_temp_celsius: 70.0,
                capabilities: vec![Capability::TextGeneration],
            },
            models: vec![],
        }
    }

    fn registry_with(id: &str, reachable: bool) -> BackendRegistry {
        let registry = BackendRegistry::new();
        registry.register(
            descriptor(id),
            Arc::new(NullAdapter {
                id: id.to_string(),
                reachable,
            }),
            2,
        );
        registry
    }

    #[tokio::test]
    async fn warm_up_marks_liveness() {
        let registry = registry_with("ollama-npu", true);
        assert!(!registry.any_routable());
        registry.warm_up().await;
        assert!(registry.any_routable());
        assert_eq!(
            registry.get("ollama-npu").unwrap().liveness(),
            Liveness::Up
        );
    }

    #[tokio::test]
    async fn warm_up_keeps_unreachable_down() {
        let registry = registry_with("ollama-npu", false);
        registry.warm_up().await;
        assert!(!registry.any_routable());
    }

    #[tokio::test]
    async fn in_flight_guard_releases_on_drop() {
        let registry = registry_with("ollama-npu", true);
        let entry = registry.get("ollama-npu").unwrap();

        let guard = registry.begin_request("ollama-npu").await.unwrap();
        assert_eq!(entry.in_flight(), 1);
        drop(guard);
        assert_eq!(entry.in_flight(), 0);
    }

    #[tokio::test]
    async fn in_flight_cap_queues_excess_requests() {
        let registry = Arc::new(registry_with("ollama-npu", true));
        let _g1 = registry.begin_request("ollama-npu").await.unwrap();
        let _g2 = registry.begin_request("ollama-npu").await.unwrap();

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.begin_request("ollama-npu").await })
        };
        tokio::task::yield_now().await;
        let entry = registry.get("ollama-npu").unwrap();
        assert_eq!(entry.in_flight(), 2);

        drop(_g1);
        let g3 = waiting.await.unwrap().unwrap();
        assert_eq!(entry.in_flight(), 2);
        drop(g3);
        drop(_g2);
        assert_eq!(entry.in_flight(), 0);
    }

    #[tokio::test]
    async fn consecutive_failures_degrade_liveness() {
        let registry = registry_with("ollama-npu", true);
        registry.warm_up().await;
        let entry = registry.get("ollama-npu").unwrap();
        entry.record_failure();
        entry.record_failure();
        assert_eq!(entry.liveness(), Liveness::Up);
        entry.record_failure();
        assert_eq!(entry.liveness(), Liveness::Degraded);
        entry.record_success();
        assert_eq!(entry.liveness(), Liveness::Up);
    }

    #[tokio::test]
    async fn unknown_backend_is_an_invariant_violation() {
        let registry = registry_with("ollama-npu", true);
        let err = registry.begin_request("ollama-ghost").await.unwrap_err();
        assert_eq!(err.code(), "internal_invariant");
    }
}
