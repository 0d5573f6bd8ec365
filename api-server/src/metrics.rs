//! Prometheus metrics surface

use anyhow::Result;
use inference_fabric_registry::BackendRegistry;
use inference_fabric_router::Router;
use inference_fabric_thermal::ThermalMonitor;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    routing_decisions: GaugeVec,
    backend_health: GaugeVec,
    backend_temperature: GaugeVec,
    backend_fan: GaugeVec,
    backend_queue_depth: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests by backend and outcome"),
            &["backend", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "End-to-end request duration",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["backend"],
        )?;
        let routing_decisions = GaugeVec::new(
            Opts::new(
                "routing_decisions",
                "Routing decision breakdown by backend",
            ),
            &["backend"],
        )?;
        let backend_health = GaugeVec::new(
            Opts::new(
                "backend_health",
                "Backend liveness: 1 up, 0.5 degraded, 0 down",
            ),
            &["backend"],
        )?;
        let backend_temperature = GaugeVec::new(
            Opts::new("backend_temperature_celsius", "Last sampled temperature"),
            &["backend"],
        )?;
        let backend_fan = GaugeVec::new(
            Opts::new("backend_fan_percent", "Last sampled fan duty"),
            &["backend"],
        )?;
        let backend_queue_depth = GaugeVec::new(
            Opts::new("backend_queue_depth", "Requests queued plus in flight"),
            &["backend"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(routing_decisions.clone()))?;
        registry.register(Box::new(backend_health.clone()))?;
        registry.register(Box::new(backend_temperature.clone()))?;
        registry.register(Box::new(backend_fan.clone()))?;
        registry.register(Box::new(backend_queue_depth.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            routing_decisions,
            backend_health,
            backend_temperature,
            backend_fan,
            backend_queue_depth,
        })
    }

    pub fn observe_request(&self, backend: &str, outcome: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.request_duration
            .with_label_values(&[backend])
            .observe(duration_secs);
    }

    /// Refresh the gauges from live state; called at scrape time
    pub fn refresh(
        &self,
        registry: &BackendRegistry,
        thermal: &ThermalMonitor,
        router: &Router,
    ) {
        for entry in registry.snapshot() {
            let id = entry.descriptor.id.as_str();
            self.backend_health
                .with_label_values(&[id])
                .set(entry.liveness().as_gauge());
            self.backend_queue_depth
                .with_label_values(&[id])
                .set((entry.queue_depth() + entry.in_flight()) as f64);
        }
        let snapshot = thermal.snapshot();
        for reading in snapshot.iter() {
            self.backend_temperature
                .with_label_values(&[reading.backend_id.as_str()])
                .set(reading.temperature_celsius);
            self.backend_fan
                .with_label_values(&[reading.backend_id.as_str()])
                .set(reading.fan_percent);
        }
        for (backend, count) in router.decision_counts() {
            self.routing_decisions
                .with_label_values(&[backend.as_str()])
                .set(count as f64);
        }
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
