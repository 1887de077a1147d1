use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod admin;
mod admission;
mod config;
mod error;
mod health;
mod lifecycle;
mod observability;
mod proxy;
mod rng;
#[cfg(test)]
mod testing;
mod topology;

use admin::AdminServer;
use admission::{AdmissionController, SystemLoadSampler};
use config::Config;
use health::{HealthMonitor, HealthTracker, HttpProbe, WebhookAlertSink};
use lifecycle::Lifecycle;
use observability::MetricsCollector;
use proxy::cache::ResponseCache;
use proxy::geo::{GeoLocator, HttpGeoLocator};
use proxy::server::{self, AppState};
use proxy::upstream::HttpBackend;
use proxy::{RequestPipeline, RoutingEngine};
use rng::SharedRng;
use topology::Topology;

const LOAD_SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const CACHE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const ALERT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "region-balancer")]
#[command(about = "A region-aware HTTP load balancer")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    observability::init_tracing(&config.logging)?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting region balancer");

    let rng = SharedRng::new(config.random_seed);
    let topology = Arc::new(Topology::from_config(&config.regions));
    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);
    let tracker = Arc::new(HealthTracker::new(
        &topology,
        &config.circuit_breaker,
        &config.self_healing,
        rng.clone(),
    ));

    // Health monitoring
    let alert_client = reqwest::Client::builder().timeout(ALERT_TIMEOUT).build()?;
    let monitor = Arc::new(HealthMonitor::new(
        topology.clone(),
        tracker.clone(),
        Arc::new(HttpProbe::new(&config.health_check)?),
        Arc::new(WebhookAlertSink::new(alert_client, config.alerts.webhook_url.clone())),
        metrics.clone(),
        &config.alerts,
    ));
    let health_task = tokio::spawn(monitor.clone().run(config.health_check.interval));
    if config.latency_routing.enabled {
        tokio::spawn(monitor.clone().run_latency_updates(config.latency_routing.check_interval));
    }

    // Routing and forwarding
    let geo: Option<Arc<dyn GeoLocator>> = match &config.geo_routing.service_url {
        Some(url) if config.geo_routing.enabled => Some(Arc::new(HttpGeoLocator::new(
            url.clone(),
            config.server.request_timeout,
        )?)),
        _ => None,
    };
    let router = Arc::new(RoutingEngine::new(
        topology.clone(),
        &config.routing,
        &config.latency_routing,
        &config.content_rules,
        geo,
        rng,
    ));
    let algorithm = router.algorithm();
    let cache = Arc::new(ResponseCache::new(&config.cache));
    if cache.is_enabled() {
        cache.start_cleanup_task(CACHE_SWEEP_PERIOD);
    }
    let lifecycle = Arc::new(Lifecycle::new());
    let pipeline = Arc::new(RequestPipeline::new(
        router,
        tracker,
        Arc::new(HttpBackend::new(config.server.request_timeout)?),
        cache.clone(),
        metrics.clone(),
        &config,
    ));

    // Admission
    let load = Arc::new(SystemLoadSampler::new());
    load.start(LOAD_SAMPLE_PERIOD);
    let admission = Arc::new(AdmissionController::new(
        &config.prioritization,
        &config.rate_limit,
        load,
        metrics.clone(),
    ));
    if config.rate_limit.enabled {
        admission.rate_limiter().start_cleanup_task(config.rate_limit.window);
    }

    // Side listeners
    let admin_task = if config.admin.enabled {
        let admin_server = AdminServer::new(
            &config.admin,
            topology.clone(),
            cache,
            admission.rate_limiter().clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.start().await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    let metrics_task = if metrics.is_enabled() {
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.start_server().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let app = server::router(AppState {
        pipeline,
        admission,
        lifecycle: lifecycle.clone(),
    });
    let server_task = {
        let server_config = config.server.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&server_config, app, lifecycle).await {
                error!("Server error: {}", e);
            }
        })
    };

    info!(
        "Region balancer started with {} regions, default region '{}', {} balancing",
        topology.regions().len(),
        config.routing.default_region,
        algorithm
    );

    tokio::select! {
        _ = lifecycle::shutdown_signal() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    lifecycle.begin_shutdown();
    let outcome = lifecycle.drain(config.server.graceful_shutdown_timeout).await;

    health_task.abort();
    if let Some(admin_task) = admin_task {
        admin_task.abort();
    }
    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    info!("Region balancer shutdown complete: {:?}", outcome);
    std::process::exit(outcome.exit_code());
}
