pub mod alerts;
pub mod circuit_breaker;
pub mod monitor;
pub mod probe;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, SelfHealingConfig};
use crate::rng::SharedRng;
use crate::topology::{Server, Topology};

pub use alerts::WebhookAlertSink;
use circuit_breaker::{BreakerSettings, CircuitBreakers, Permit};
pub use monitor::HealthMonitor;
pub use probe::HttpProbe;

const FAILURE_PENALTY: i16 = -20;
const SUCCESS_REWARD: i16 = 5;

/// Admission to contact a server, obtained from [`HealthTracker::admit`].
#[derive(Debug)]
pub struct CallTicket {
    permit: Option<Permit>,
}

/// Shared failure/success accounting for probes and proxied calls.
///
/// Owns the per-server circuit breakers. When breakers are disabled a failure
/// marks the server down directly and a successful probe marks it up.
#[derive(Debug)]
pub struct HealthTracker {
    breakers: Option<CircuitBreakers>,
    healing: SelfHealingConfig,
    rng: SharedRng,
}

impl HealthTracker {
    pub fn new(
        topology: &Topology,
        breaker_config: &CircuitBreakerConfig,
        healing: &SelfHealingConfig,
        rng: SharedRng,
    ) -> Self {
        let breakers = breaker_config
            .enabled
            .then(|| CircuitBreakers::new(topology, &BreakerSettings::from(breaker_config)));

        Self {
            breakers,
            healing: healing.clone(),
            rng,
        }
    }

    /// `None` when the server's breaker is failing fast.
    pub fn admit(&self, region: &str, server: &Server) -> Option<CallTicket> {
        let breaker = match self
            .breakers
            .as_ref()
            .and_then(|b| b.get(region, &server.domain))
        {
            Some(breaker) => breaker,
            None => return Some(CallTicket { permit: None }),
        };

        match breaker.try_acquire(Instant::now()) {
            Some(permit) => Some(CallTicket {
                permit: Some(permit),
            }),
            None => {
                debug!("Circuit open for {}, skipping", server.domain);
                None
            }
        }
    }

    /// Returns true when the server came back online.
    pub fn record_probe_success(&self, server: &Server, ticket: CallTicket) -> bool {
        let was_down = server.is_down();
        server.adjust_health_score(SUCCESS_REWARD);

        match ticket.permit {
            Some(permit) => {
                permit.succeed();
            }
            None => {
                server.set_down(false);
            }
        }

        was_down && !server.is_down()
    }

    pub fn record_call_success(&self, ticket: CallTicket) {
        if let Some(permit) = ticket.permit {
            permit.succeed();
        }
    }

    /// Returns true when this failure took the server down.
    pub fn record_failure(&self, server: &Server, ticket: CallTicket) -> bool {
        let was_down = server.is_down();
        let score = server.adjust_health_score(FAILURE_PENALTY);

        match ticket.permit {
            Some(permit) => {
                permit.fail(Instant::now());
            }
            None => {
                server.set_down(true);
            }
        }

        debug!("Recorded failure for {}, health score now {}", server.domain, score);
        !was_down && server.is_down()
    }

    /// Optimistically brings a down server back with the configured probability.
    pub fn attempt_heal(&self, region: &str, server: &Arc<Server>) -> bool {
        if !self.healing.enabled || !server.is_down() {
            return false;
        }

        info!("Attempting to heal server {} in region {}", server.domain, region);
        if self.rng.chance(self.healing.probability) {
            server.set_down(false);
            info!(
                "Server {} in region {} has been healed and is back online",
                server.domain, region
            );
            true
        } else {
            warn!("Failed to heal server {} in region {}", server.domain, region);
            false
        }
    }
}
