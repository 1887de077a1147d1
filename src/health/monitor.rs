use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AlertConfig;
use crate::observability::MetricsCollector;
use crate::topology::{Region, Server, Topology};

use super::alerts::{Alert, AlertSink, REGION_DOWN, SERVER_DOWN};
use super::probe::HealthProbe;
use super::HealthTracker;

/// What one probe cycle learned about a server
#[derive(Debug, Clone, Copy, Default)]
struct Observation {
    healthy: bool,
    went_down: bool,
    came_back: bool,
}

/// Periodically probes every server and keeps the topology's live state current.
pub struct HealthMonitor {
    topology: Arc<Topology>,
    tracker: Arc<HealthTracker>,
    probe: Arc<dyn HealthProbe>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<MetricsCollector>,
    alert_config: AlertConfig,
    server_streak: AtomicU32,
    region_streak: AtomicU32,
}

impl HealthMonitor {
    pub fn new(
        topology: Arc<Topology>,
        tracker: Arc<HealthTracker>,
        probe: Arc<dyn HealthProbe>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<MetricsCollector>,
        alert_config: &AlertConfig,
    ) -> Self {
        Self {
            topology,
            tracker,
            probe,
            alerts,
            metrics,
            alert_config: alert_config.clone(),
            server_streak: AtomicU32::new(0),
            region_streak: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    pub fn server_failure_streak(&self) -> u32 {
        self.server_streak.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn region_failure_streak(&self) -> u32 {
        self.region_streak.load(Ordering::Acquire)
    }

    /// Runs health cycles forever on a fixed period.
    pub async fn run(self: Arc<Self>, period: Duration) {
        info!("Starting health monitoring every {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }

    /// Refreshes every server's latency forever on a fixed period.
    pub async fn run_latency_updates(self: Arc<Self>, period: Duration) {
        info!("Starting latency measurements every {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.update_latencies().await;
        }
    }

    pub async fn update_latencies(&self) {
        for (_, server) in self.topology.servers() {
            let latency = self.probe.measure_latency(server).await;
            debug!("Latency for {}: {:?}", server.domain, latency);
            server.set_latency(latency);
        }
    }

    /// One pass over all regions. Servers of a region are probed concurrently;
    /// streaks and alerts are then applied in configured order.
    pub async fn run_cycle(&self) {
        let mut any_region_down = false;

        for region in self.topology.regions() {
            let observations = join_all(
                region
                    .servers
                    .iter()
                    .map(|server| self.check_server(region, server)),
            )
            .await;

            let mut region_down = true;
            for (server, observation) in region.servers.iter().zip(observations) {
                self.apply_observation(region, server, observation);
                if observation.healthy {
                    region_down = false;
                }
            }

            if region_down {
                any_region_down = true;
                self.on_region_down(region);
            }
        }

        if !any_region_down {
            self.region_streak.store(0, Ordering::Release);
        }
    }

    async fn check_server(&self, region: &Region, server: &Arc<Server>) -> Observation {
        let ticket = match self.tracker.admit(&region.name, server) {
            Some(ticket) => ticket,
            // Breaker open: no probe this cycle.
            None => return Observation::default(),
        };

        let result = self.probe.probe(server).await;
        debug!(
            "Server {} in region {} health status: {} (HTTP {})",
            server.domain,
            region.name,
            if result.healthy { "Healthy" } else { "Unhealthy" },
            result
                .status_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        let observation = if result.healthy {
            if let Some(latency) = result.latency {
                server.set_latency(Some(latency));
            }
            Observation {
                healthy: true,
                went_down: false,
                came_back: self.tracker.record_probe_success(server, ticket),
            }
        } else {
            warn!(
                "Health check failed for {}: {}",
                server.domain,
                result.error.as_deref().unwrap_or("unknown error")
            );
            Observation {
                healthy: false,
                went_down: self.tracker.record_failure(server, ticket),
                came_back: false,
            }
        };

        self.metrics.record_server_state(server);
        observation
    }

    fn apply_observation(&self, region: &Region, server: &Arc<Server>, observation: Observation) {
        if observation.went_down {
            let streak = self.server_streak.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                "Server {} in region {} is down (failure streak {})",
                server.domain, region.name, streak
            );
            if streak >= self.alert_config.server_failure_streak {
                self.alerts.dispatch(Alert::new(
                    SERVER_DOWN,
                    format!("Server {} in region {} is down", server.domain, region.name),
                ));
                self.server_streak.store(0, Ordering::Release);
            }
            if self.tracker.attempt_heal(&region.name, server) {
                self.metrics.record_server_state(server);
            }
        } else if observation.came_back {
            info!("Server {} in region {} is back online", server.domain, region.name);
            self.server_streak.store(0, Ordering::Release);
        }
    }

    fn on_region_down(&self, region: &Region) {
        let streak = self.region_streak.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "All backend servers in region {} are down (region streak {})",
            region.name, streak
        );
        if streak >= self.alert_config.region_failure_streak {
            self.alerts.dispatch(Alert::new(
                REGION_DOWN,
                format!("All backend servers in {} are down", region.name),
            ));
            self.region_streak.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, SelfHealingConfig};
    use crate::rng::SharedRng;
    use crate::testing::{topology_of, RecordingAlerts, ScriptedProbe};
    use crate::topology::CircuitState;

    struct Harness {
        topology: Arc<Topology>,
        probe: Arc<ScriptedProbe>,
        alerts: Arc<RecordingAlerts>,
        monitor: HealthMonitor,
    }

    fn harness(
        regions: &[(&str, &[&str])],
        breaker: CircuitBreakerConfig,
        heal_probability: Option<f64>,
    ) -> Harness {
        let topology = Arc::new(topology_of(regions));
        let healing = SelfHealingConfig {
            enabled: heal_probability.is_some(),
            probability: heal_probability.unwrap_or(0.0),
        };
        let tracker = Arc::new(HealthTracker::new(
            &topology,
            &breaker,
            &healing,
            SharedRng::new(Some(11)),
        ));
        let probe = Arc::new(ScriptedProbe::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let monitor = HealthMonitor::new(
            topology.clone(),
            tracker,
            probe.clone(),
            alerts.clone(),
            Arc::new(MetricsCollector::disabled()),
            &AlertConfig {
                webhook_url: None,
                server_failure_streak: 3,
                region_failure_streak: 3,
            },
        );
        Harness {
            topology,
            probe,
            alerts,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_three_failures_fire_one_server_down_alert() {
        let h = harness(
            &[("us-east", &["http://a", "http://b"])],
            CircuitBreakerConfig::default(),
            Some(1.0),
        );
        h.probe.set_healthy("http://b", true);
        h.probe.set_healthy("http://a", false);

        for _ in 0..3 {
            h.monitor.run_cycle().await;
        }

        let server_alerts: Vec<_> = h
            .alerts
            .recorded()
            .into_iter()
            .filter(|a| a.kind == SERVER_DOWN)
            .collect();
        assert_eq!(server_alerts.len(), 1);
        assert!(server_alerts[0].message.contains("http://a"));
        assert_eq!(h.monitor.server_failure_streak(), 0);
        assert_eq!(h.topology.regions()[0].servers[0].health_score(), 40);
    }

    #[tokio::test]
    async fn test_down_server_counts_once_without_healing() {
        let h = harness(
            &[("us-east", &["http://a", "http://b"])],
            CircuitBreakerConfig::default(),
            None,
        );
        h.probe.set_healthy("http://b", true);
        h.probe.set_healthy("http://a", false);

        for _ in 0..3 {
            h.monitor.run_cycle().await;
        }

        assert_eq!(h.monitor.server_failure_streak(), 1);
        assert!(h.alerts.recorded().is_empty());
        assert!(h.topology.regions()[0].servers[0].is_down());
    }

    #[tokio::test]
    async fn test_failed_healing_alerts_once_and_resets_streak() {
        let h = harness(
            &[("us-east", &["http://a", "http://b", "http://c", "http://d"])],
            CircuitBreakerConfig::default(),
            Some(0.0),
        );
        for domain in ["http://a", "http://b", "http://c"] {
            h.probe.set_healthy(domain, false);
        }
        h.probe.set_healthy("http://d", true);

        for _ in 0..3 {
            h.monitor.run_cycle().await;
        }

        let alerts = h.alerts.recorded();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, SERVER_DOWN);
        assert!(alerts[0].message.contains("http://c"));
        assert_eq!(h.monitor.server_failure_streak(), 0);
        let servers = &h.topology.regions()[0].servers;
        assert!(servers[..3].iter().all(|s| s.is_down()));
        assert!(!servers[3].is_down());
    }

    #[tokio::test]
    async fn test_recovery_resets_streak_and_marks_up() {
        let h = harness(
            &[("us-east", &["http://a", "http://b"])],
            CircuitBreakerConfig::default(),
            None,
        );
        h.probe.set_healthy("http://b", true);
        h.probe.set_healthy("http://a", false);
        h.monitor.run_cycle().await;
        assert_eq!(h.monitor.server_failure_streak(), 1);

        h.probe.set_healthy("http://a", true);
        h.monitor.run_cycle().await;
        let server = &h.topology.regions()[0].servers[0];
        assert!(!server.is_down());
        assert_eq!(server.health_score(), 85);
        assert_eq!(h.monitor.server_failure_streak(), 0);
    }

    #[tokio::test]
    async fn test_region_down_alert_has_its_own_streak() {
        let h = harness(
            &[("us-east", &["http://a"]), ("eu-west", &["http://c"])],
            CircuitBreakerConfig::default(),
            None,
        );
        h.probe.set_healthy("http://a", false);
        h.probe.set_healthy("http://c", true);

        h.monitor.run_cycle().await;
        h.monitor.run_cycle().await;
        assert_eq!(h.monitor.region_failure_streak(), 2);
        h.monitor.run_cycle().await;

        let region_alerts: Vec<_> = h
            .alerts
            .recorded()
            .into_iter()
            .filter(|a| a.kind == REGION_DOWN)
            .collect();
        assert_eq!(region_alerts.len(), 1);
        assert!(region_alerts[0].message.contains("us-east"));
        assert_eq!(h.monitor.region_failure_streak(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_probe_until_reset() {
        let breaker = CircuitBreakerConfig {
            enabled: true,
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(50),
            window_size: 1,
            minimum_calls: 1,
        };
        let h = harness(&[("us-east", &["http://a", "http://b"])], breaker, None);
        h.probe.set_healthy("http://b", true);
        h.probe.set_healthy("http://a", false);

        h.monitor.run_cycle().await;
        let server = h.topology.regions()[0].servers[0].clone();
        assert_eq!(server.circuit_state(), CircuitState::Open);
        assert!(server.is_down());
        assert_eq!(h.probe.calls("http://a"), 1);

        h.monitor.run_cycle().await;
        assert_eq!(h.probe.calls("http://a"), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.probe.set_healthy("http://a", true);
        h.monitor.run_cycle().await;
        assert_eq!(h.probe.calls("http://a"), 2);
        assert_eq!(server.circuit_state(), CircuitState::Closed);
        assert!(!server.is_down());
    }

    #[tokio::test]
    async fn test_latency_updates() {
        let h = harness(
            &[("us-east", &["http://a", "http://b"])],
            CircuitBreakerConfig::default(),
            None,
        );
        h.probe.set_latency("http://a", Some(Duration::from_millis(30)));
        h.probe.set_latency("http://b", None);
        h.monitor.update_latencies().await;

        let servers = &h.topology.regions()[0].servers;
        assert_eq!(servers[0].latency(), Some(Duration::from_millis(30)));
        assert_eq!(servers[1].latency(), None);
    }
}
