//! Admission Controller: rejects requests before they reach the pipeline.
//!
//! Priority shedding is checked before rate limiting, so a shed request never
//! consumes rate-limit budget.

pub mod load;
pub mod rate_limiter;

use std::sync::Arc;

use tracing::warn;

use crate::config::{PrioritizationConfig, RateLimitConfig};
use crate::error::BalancerError;
use crate::observability::MetricsCollector;
use crate::proxy::{InboundRequest, Priority};

pub use load::{LoadSampler, SystemLoadSampler};
pub use rate_limiter::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// LOW priority under excessive load, answered with 503.
    Shed,
    /// Over the per-window ceiling, answered with 429.
    RateLimited,
}

impl Verdict {
    pub fn into_error(self) -> Option<BalancerError> {
        match self {
            Verdict::Admit => None,
            Verdict::Shed => Some(BalancerError::Shed),
            Verdict::RateLimited => Some(BalancerError::RateLimited),
        }
    }
}

pub struct AdmissionController {
    prioritization: PrioritizationConfig,
    rate_limiting: bool,
    limiter: Arc<RateLimiter>,
    sampler: Arc<dyn LoadSampler>,
    metrics: Arc<MetricsCollector>,
}

impl AdmissionController {
    pub fn new(
        prioritization: &PrioritizationConfig,
        rate_limit: &RateLimitConfig,
        sampler: Arc<dyn LoadSampler>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            prioritization: prioritization.clone(),
            rate_limiting: rate_limit.enabled,
            limiter: Arc::new(RateLimiter::new(rate_limit)),
            sampler,
            metrics,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn admit(&self, request: &InboundRequest, priority: Priority) -> Verdict {
        let load = self.sampler.current_load();

        if priority == Priority::Low && load > self.prioritization.low_priority_max_load {
            warn!("Shedding low priority request at {:.1}% load", load);
            self.metrics.record_rejection("shed");
            return Verdict::Shed;
        }

        if self.rate_limiting && !self.limiter.check(&request.client_key(), load).await {
            self.metrics.record_rejection("rate_limited");
            return Verdict::RateLimited;
        }

        Verdict::Admit
    }
}
