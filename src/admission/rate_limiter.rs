use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// One client's current window
#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
    ceiling: u32,
}

/// Fixed-window request counter per client key. The ceiling of a window is
/// derived from system load when the window opens.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<DashMap<String, Window>>,
    statistics: Arc<RwLock<RateLimiterStatistics>>,
}

#[derive(Debug, Default)]
struct RateLimiterStatistics {
    requests: u64,
    blocked: u64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
            windows: Arc::new(DashMap::new()),
            statistics: Arc::new(RwLock::new(RateLimiterStatistics::default())),
        }
    }

    /// `max` up to the moderate threshold, 75% above it, 50% above the high one.
    pub fn ceiling_for(&self, load: f64) -> u32 {
        let max = self.config.max_requests as u64;
        let ceiling = if load > self.config.high_load {
            max / 2
        } else if load > self.config.moderate_load {
            max * 3 / 4
        } else {
            max
        };
        ceiling as u32
    }

    /// Counts the request; false when the key is over its ceiling.
    pub async fn check(&self, key: &str, load: f64) -> bool {
        let now = Instant::now();
        let allowed = {
            let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
                started: now,
                count: 0,
                ceiling: self.ceiling_for(load),
            });
            if now.duration_since(window.started) >= self.config.window {
                *window = Window {
                    started: now,
                    count: 0,
                    ceiling: self.ceiling_for(load),
                };
            }
            window.count = window.count.saturating_add(1);
            window.count <= window.ceiling
        };

        let mut stats = self.statistics.write().await;
        stats.requests += 1;
        if allowed {
            debug!("Rate limit check passed for {}", key);
        } else {
            stats.blocked += 1;
            warn!("Rate limit exceeded for {}", key);
        }
        allowed
    }

    /// Periodically drops windows that have ended.
    pub fn start_cleanup_task(self: &Arc<Self>, period: Duration) {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiter.cleanup_expired_windows();
            }
        });
    }

    pub fn cleanup_expired_windows(&self) -> usize {
        let before = self.windows.len();
        let window = self.config.window;
        self.windows.retain(|_, w| w.started.elapsed() < window);
        let removed = before.saturating_sub(self.windows.len());
        debug!(
            "Cleaned up {} rate limit windows, {} active",
            removed,
            self.windows.len()
        );
        removed
    }

    pub async fn get_statistics(&self) -> serde_json::Value {
        let stats = self.statistics.read().await;
        serde_json::json!({
            "requests": stats.requests,
            "blocked": stats.blocked,
            "active_windows": self.windows.len(),
            "block_rate": if stats.requests > 0 {
                (stats.blocked as f64) / (stats.requests as f64)
            } else { 0.0 }
        })
    }
}
