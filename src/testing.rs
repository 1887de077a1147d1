//! Scripted collaborators for unit tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::admission::LoadSampler;
use crate::config::{BackendServerConfig, Config, RegionConfig};
use crate::error::{BalancerError, Result};
use crate::health::alerts::{Alert, AlertSink};
use crate::health::probe::{HealthProbe, ProbeResult};
use crate::health::HealthTracker;
use crate::observability::MetricsCollector;
use crate::proxy::cache::ResponseCache;
use crate::proxy::geo::GeoLocator;
use crate::proxy::upstream::{BackendClient, BackendRequest};
use crate::proxy::{ProxyResponse, RequestPipeline, RoutingEngine};
use crate::rng::SharedRng;
use crate::topology::{Server, Topology};

/// Builds a topology where every server has weight 1.
pub fn topology_of(regions: &[(&str, &[&str])]) -> Topology {
    let regions: Vec<RegionConfig> = regions
        .iter()
        .map(|(name, domains)| RegionConfig {
            name: name.to_string(),
            servers: domains
                .iter()
                .map(|d| BackendServerConfig {
                    domain: d.to_string(),
                    weight: 1,
                })
                .collect(),
        })
        .collect();
    Topology::from_config(&regions)
}

/// Probe whose answers are set per domain. Servers are healthy unless told otherwise.
#[derive(Default)]
pub struct ScriptedProbe {
    unhealthy: Mutex<HashMap<String, bool>>,
    latencies: Mutex<HashMap<String, Option<Duration>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedProbe {
    pub fn set_healthy(&self, domain: &str, healthy: bool) {
        self.unhealthy.lock().insert(domain.to_string(), !healthy);
    }

    pub fn set_latency(&self, domain: &str, latency: Option<Duration>) {
        self.latencies.lock().insert(domain.to_string(), latency);
    }

    pub fn calls(&self, domain: &str) -> usize {
        self.calls.lock().get(domain).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, server: &Server) -> ProbeResult {
        *self.calls.lock().entry(server.domain.clone()).or_insert(0) += 1;
        let unhealthy = self.unhealthy.lock().get(&server.domain).copied().unwrap_or(false);
        if unhealthy {
            ProbeResult::unhealthy(Some(503), "HTTP 503")
        } else {
            let latency = self
                .latencies
                .lock()
                .get(&server.domain)
                .copied()
                .flatten()
                .unwrap_or(Duration::from_millis(1));
            ProbeResult::healthy(latency, 200)
        }
    }

    async fn measure_latency(&self, server: &Server) -> Option<Duration> {
        self.latencies.lock().get(&server.domain).copied().flatten()
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn recorded(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn dispatch(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

#[derive(Debug, Clone)]
struct Script {
    status: u16,
    failing: bool,
    delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            status: 200,
            failing: false,
            delay: None,
        }
    }
}

/// Backend that answers with its own domain as the body.
#[derive(Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<(String, BackendRequest)>>,
}

impl FakeBackend {
    pub fn set_status(&self, domain: &str, status: u16) {
        self.scripts.lock().entry(domain.to_string()).or_default().status = status;
    }

    /// A failing backend produces a transport error.
    pub fn set_failing(&self, domain: &str, failing: bool) {
        self.scripts.lock().entry(domain.to_string()).or_default().failing = failing;
    }

    pub fn set_delay(&self, domain: &str, delay: Duration) {
        self.scripts.lock().entry(domain.to_string()).or_default().delay = Some(delay);
    }

    pub fn calls(&self, domain: &str) -> usize {
        self.requests.lock().iter().filter(|(d, _)| d == domain).count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self, domain: &str) -> Option<BackendRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(d, _)| d == domain)
            .map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn send(&self, domain: &str, request: &BackendRequest) -> Result<ProxyResponse> {
        self.requests.lock().push((domain.to_string(), request.clone()));
        let script = self.scripts.lock().get(domain).cloned().unwrap_or_default();

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if script.failing {
            return Err(BalancerError::Upstream(format!("connection to {} refused", domain)));
        }

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let body = if script.status == 429 {
            Bytes::from_static(b"slow down")
        } else {
            Bytes::from(domain.to_string())
        };
        Ok(ProxyResponse {
            status: script.status,
            headers,
            body,
        })
    }
}

pub struct FixedLoad(AtomicU64);

impl FixedLoad {
    pub fn new(load: f64) -> Self {
        Self(AtomicU64::new(load.to_bits()))
    }

    pub fn set(&self, load: f64) {
        self.0.store(load.to_bits(), Ordering::Release);
    }
}

impl LoadSampler for FixedLoad {
    fn current_load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

pub struct StaticGeo(Option<String>);

impl StaticGeo {
    pub fn answering(region: &str) -> Self {
        Self(Some(region.to_string()))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl GeoLocator for StaticGeo {
    async fn locate(&self, _ip: IpAddr) -> Result<String> {
        self.0
            .clone()
            .ok_or_else(|| BalancerError::Upstream("geo-routing service unreachable".to_string()))
    }
}

/// A pipeline over `config.regions` with scripted backends and no geo lookup.
pub fn pipeline_for(
    config: &Config,
    backend: Arc<FakeBackend>,
) -> (Arc<RequestPipeline>, Arc<Topology>) {
    let topology = Arc::new(Topology::from_config(&config.regions));
    let rng = SharedRng::new(Some(17));
    let router = Arc::new(RoutingEngine::new(
        topology.clone(),
        &config.routing,
        &config.latency_routing,
        &config.content_rules,
        None,
        rng.clone(),
    ));
    let tracker = Arc::new(HealthTracker::new(
        &topology,
        &config.circuit_breaker,
        &config.self_healing,
        rng,
    ));
    let pipeline = Arc::new(RequestPipeline::new(
        router,
        tracker,
        backend,
        Arc::new(ResponseCache::new(&config.cache)),
        Arc::new(MetricsCollector::disabled()),
        config,
    ));
    (pipeline, topology)
}
