//! Shared application state

use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;
use inference_fabric_efficiency::EfficiencyManager;
use inference_fabric_forwarding::GenerationService;
use inference_fabric_pipeline::PipelineExecutor;
use inference_fabric_registry::BackendRegistry;
use inference_fabric_router::Router;
use inference_fabric_thermal::ThermalMonitor;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GenerationService>,
    pub router: Arc<Router>,
    pub registry: Arc<BackendRegistry>,
    pub thermal: Arc<ThermalMonitor>,
    pub efficiency: Arc<EfficiencyManager>,
    pub pipeline: Arc<PipelineExecutor>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Empty means auth is disabled
    pub api_keys: Arc<Vec<String>>,
    pub started_at: Instant,
}
