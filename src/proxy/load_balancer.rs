use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::Algorithm;
use crate::rng::SharedRng;
use crate::topology::Server;

/// Load balancer implementation
#[derive(Debug)]
pub struct LoadBalancer {
    algorithm: LoadBalancerAlgorithm,
    rng: SharedRng,
}

#[derive(Debug)]
enum LoadBalancerAlgorithm {
    RoundRobin { current: AtomicUsize },
    WeightedRoundRobin,
    LowestLatency,
}

impl LoadBalancer {
    /// Latency-based selection, when enabled, replaces the configured algorithm.
    pub fn new(algorithm: Algorithm, latency_based: bool, rng: SharedRng) -> Self {
        let algorithm = if latency_based {
            LoadBalancerAlgorithm::LowestLatency
        } else {
            match algorithm {
                Algorithm::RoundRobin => LoadBalancerAlgorithm::RoundRobin {
                    current: AtomicUsize::new(0),
                },
                Algorithm::WeightedRoundRobin => LoadBalancerAlgorithm::WeightedRoundRobin,
            }
        };

        Self { algorithm, rng }
    }

    /// Select a server from the live set
    pub fn select(&self, live: &[Arc<Server>]) -> Option<Arc<Server>> {
        if live.is_empty() {
            return None;
        }

        let selected = match &self.algorithm {
            LoadBalancerAlgorithm::RoundRobin { current } => {
                let index = current.fetch_add(1, Ordering::Relaxed) % live.len();
                &live[index]
            }
            LoadBalancerAlgorithm::WeightedRoundRobin => self.select_weighted(live),
            LoadBalancerAlgorithm::LowestLatency => live
                .iter()
                .min_by_key(|server| server.latency_rank())
                .unwrap_or(&live[0]),
        };

        debug!("{} selected server {}", self.get_type(), selected.domain);
        Some(selected.clone())
    }

    fn select_weighted<'a>(&self, live: &'a [Arc<Server>]) -> &'a Arc<Server> {
        let total: u64 = live.iter().map(|s| s.weight as u64).sum();
        if total == 0 {
            return &live[0];
        }

        let mut draw = self.rng.below(total);
        for server in live {
            let weight = server.weight as u64;
            if draw < weight {
                return server;
            }
            draw -= weight;
        }
        &live[live.len() - 1]
    }

    /// Get load balancer type for reporting
    pub fn get_type(&self) -> &'static str {
        match &self.algorithm {
            LoadBalancerAlgorithm::RoundRobin { .. } => "round_robin",
            LoadBalancerAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancerAlgorithm::LowestLatency => "latency",
        }
    }
}
