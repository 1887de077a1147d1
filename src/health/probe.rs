use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::HealthCheckConfig;
use crate::topology::Server;

/// Outcome of one health probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency: Option<Duration>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency: Duration, status_code: u16) -> Self {
        Self {
            healthy: true,
            latency: Some(latency),
            status_code: Some(status_code),
            error: None,
        }
    }

    pub fn unhealthy(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency: None,
            status_code,
            error: Some(error.into()),
        }
    }
}

/// Active check against a backend. Errors are folded into the result.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, server: &Server) -> ProbeResult;

    /// Round-trip time of a single request, `None` on failure.
    async fn measure_latency(&self, server: &Server) -> Option<Duration>;
}

/// GETs the configured health path, retrying within one probe.
pub struct HttpProbe {
    client: Client,
    path: String,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl HttpProbe {
    pub fn new(config: &HealthCheckConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("region-balancer-health/1.0")
            .build()?;

        Ok(Self {
            client,
            path: config.path.clone(),
            timeout: config.timeout,
            attempts: config.ping_retries.max(1),
            retry_delay: config.ping_retry_delay,
        })
    }

    fn health_url(&self, server: &Server) -> String {
        format!("{}{}", server.domain.trim_end_matches('/'), self.path)
    }

    async fn attempt(&self, url: &str) -> ProbeResult {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                ProbeResult::healthy(start.elapsed(), response.status().as_u16())
            }
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                ProbeResult::unhealthy(Some(status), format!("HTTP {}", status))
            }
            Ok(Err(e)) => ProbeResult::unhealthy(None, e.to_string()),
            Err(_) => ProbeResult::unhealthy(None, "Health check timeout"),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, server: &Server) -> ProbeResult {
        let url = self.health_url(server);
        let mut last = ProbeResult::unhealthy(None, "not attempted");

        for attempt in 1..=self.attempts {
            last = self.attempt(&url).await;
            if last.healthy {
                return last;
            }
            debug!(
                "Health check attempt {}/{} failed for {}: {}",
                attempt,
                self.attempts,
                server.domain,
                last.error.as_deref().unwrap_or_default()
            );
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        last
    }

    async fn measure_latency(&self, server: &Server) -> Option<Duration> {
        let url = self.health_url(server);
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, self.client.get(&url).send()).await {
            Ok(Ok(_)) => Some(start.elapsed()),
            Ok(Err(e)) => {
                debug!("Latency check failed for {}: {}", server.domain, e);
                None
            }
            Err(_) => None,
        }
    }
}
