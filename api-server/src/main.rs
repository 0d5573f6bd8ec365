//! inference-fabricd — the local inference router daemon

use anyhow::{Context, Result};
use clap::Parser;
use inference_fabric_api_server::{build_router, AppState};
use inference_fabric_api_server::metrics::Metrics;
use inference_fabric_api_server::rate_limiter::{RateLimitConfig, RateLimiter};
use inference_fabric_config::FabricConfig;
use inference_fabric_contracts::HardwareClass;
use inference_fabric_efficiency::EfficiencyManager;
use inference_fabric_forwarding::GenerationService;
use inference_fabric_pipeline::PipelineExecutor;
use inference_fabric_registry::{BackendRegistry, HttpAdapterConfig, OpenAiHttpAdapter};
use inference_fabric_resilience::BreakerRegistry;
use inference_fabric_router::Router;
use inference_fabric_thermal::{NvidiaSmiProbe, SysfsProbe, TelemetryProbe, ThermalMonitor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inference-fabricd")]
#[command(about = "Local inference router across heterogeneous accelerators")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "fabric.toml")]
    config: PathBuf,

    /// Thermal poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = FabricConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if config.server.grpc_port != 0 {
        info!(
            grpc_port = config.server.grpc_port,
            "grpc_port parsed; RPC transport is fronted by an external collaborator"
        );
    }

    // Backend pool: one HTTP adapter and one telemetry probe per engine
    let registry = Arc::new(BackendRegistry::new());
    let mut thermal_backends: Vec<(_, Arc<dyn TelemetryProbe>)> = Vec::new();
    for backend in config.enabled_backends() {
        let descriptor = backend.descriptor();
        let adapter = OpenAiHttpAdapter::new(
            descriptor.id.clone(),
            descriptor.endpoint.clone(),
            descriptor.characteristics.capabilities.clone(),
            HttpAdapterConfig::default(),
        )
        .map_err(|error| anyhow::anyhow!("adapter for {}: {}", descriptor.id, error))?;

        let probe: Arc<dyn TelemetryProbe> = match descriptor.hardware {
            HardwareClass::Dgpu => Arc::new(NvidiaSmiProbe::new()),
            hardware => Arc::new(SysfsProbe::for_hardware(hardware)),
        };
        thermal_backends.push((descriptor.clone(), probe));
        registry.register(descriptor, Arc::new(adapter), backend.max_in_flight);
    }

    info!(backends = registry.len(), "warming up backend pool");
    registry.warm_up().await;

    let cancel = CancellationToken::new();

    let thermal = Arc::new(ThermalMonitor::new(
        thermal_backends,
        Duration::from_millis(args.poll_interval_ms),
    ));
    let thermal_task = tokio::spawn(thermal.clone().run(cancel.clone()));

    let efficiency = Arc::new(EfficiencyManager::with_system_inputs(
        config.efficiency_config()?,
    ));
    // Resolve the configured default (Auto included) before serving
    efficiency
        .set_mode(efficiency.requested_mode())
        .await
        .map_err(|error| anyhow::anyhow!("initial mode: {}", error))?;
    let efficiency_task = tokio::spawn(efficiency.clone().run(cancel.clone()));

    let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
    let mut router = Router::new(
        registry.clone(),
        thermal.clone(),
        efficiency.clone(),
        breakers.clone(),
    );
    if let Some(weights) = config.router.scoring_weights {
        router = router.with_balanced_weights(weights.into());
    }
    let router = Arc::new(router);

    let service = Arc::new(GenerationService::new(
        router.clone(),
        registry.clone(),
        breakers.clone(),
        config.forwarding_config(),
    ));
    let pipeline = Arc::new(PipelineExecutor::new(
        router.clone(),
        registry.clone(),
        breakers.clone(),
    ));

    let state = AppState {
        service,
        router,
        registry,
        thermal,
        efficiency,
        pipeline,
        metrics: Arc::new(Metrics::new()?),
        rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_second: config.ratelimit.requests_per_second,
            burst: config.ratelimit.burst,
        })),
        api_keys: Arc::new(config.auth.api_keys.clone()),
        started_at: std::time::Instant::now(),
    };

    let app = build_router(state);
    let address: SocketAddr = format!("{}:{}", config.server.host, config.server.http_port)
        .parse()
        .context("parsing listen address")?;
    if config.server.tls.enabled {
        warn!("TLS termination is delegated to the deployment edge; serving plaintext locally");
    }

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!(%address, "inference fabric serving");

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    })
    .await
    .context("serving HTTP")?;

    // Background tasks observe the same token; wait for them to wind down
    cancel.cancel();
    let _ = thermal_task.await;
    let _ = efficiency_task.await;
    info!("inference fabric stopped");
    Ok(())
}
