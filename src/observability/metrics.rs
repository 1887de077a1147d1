use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{BalancerError, Result as BalancerResult};
use crate::topology::Server;

/// Metrics collector that handles all application metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();

            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    /// A collector that records nothing.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig {
                enabled: false,
                ..Default::default()
            },
            prometheus_handle: None,
        }
    }

    fn register_metrics() {
        describe_counter!("lb_requests_total", "Total number of requests answered by the balancer");
        describe_histogram!("lb_request_duration_seconds", "End-to-end request duration in seconds");
        describe_histogram!("http_request_duration_ms", "Backend call duration in milliseconds per server");
        describe_counter!("lb_backend_failures_total", "Failed backend calls per server");
        describe_counter!("lb_cache_hits_total", "Responses served from the cache");
        describe_counter!("lb_cache_misses_total", "Cacheable requests not found in the cache");
        describe_counter!("lb_admission_rejections_total", "Requests rejected before the pipeline");
        describe_counter!("lb_alerts_total", "Alerts dispatched to the webhook");
        describe_gauge!("lb_server_health_score", "Current health score per server");
        describe_gauge!("lb_server_up", "1 when the server is up, 0 when down");
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Render the Prometheus exposition text, if the recorder is installed.
    #[cfg(test)]
    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(|h| h.render())
    }

    /// Start the metrics server
    pub async fn start_server(&self) -> BalancerResult<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => {
                return Err(BalancerError::Internal(
                    "Prometheus handle not available".to_string(),
                ))
            }
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BalancerError::Internal(format!("Failed to bind metrics server: {}", e)))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| BalancerError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }

    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        if !self.config.enabled {
            return;
        }

        counter!("lb_requests_total", "method" => method.to_string(), "status" => status.to_string())
            .increment(1);
        histogram!("lb_request_duration_seconds", "method" => method.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn record_backend_call(&self, server: &str, duration: Duration, ok: bool) {
        if !self.config.enabled {
            return;
        }

        histogram!("http_request_duration_ms", "server" => server.to_string())
            .record(duration.as_secs_f64() * 1000.0);
        if !ok {
            counter!("lb_backend_failures_total", "server" => server.to_string()).increment(1);
        }
    }

    pub fn record_cache(&self, hit: bool) {
        if !self.config.enabled {
            return;
        }

        if hit {
            counter!("lb_cache_hits_total").increment(1);
        } else {
            counter!("lb_cache_misses_total").increment(1);
        }
    }

    pub fn record_rejection(&self, reason: &'static str) {
        if !self.config.enabled {
            return;
        }

        counter!("lb_admission_rejections_total", "reason" => reason).increment(1);
    }

    pub fn record_server_state(&self, server: &Server) {
        if !self.config.enabled {
            return;
        }

        gauge!("lb_server_health_score", "server" => server.domain.clone())
            .set(server.health_score() as f64);
        gauge!("lb_server_up", "server" => server.domain.clone())
            .set(if server.is_down() { 0.0 } else { 1.0 });
    }
}
