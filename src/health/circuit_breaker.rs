//! Per-server circuit breaker.
//!
//! ```text
//! Closed   -> Open      failure rate over the window >= threshold
//! Open     -> HalfOpen  first admission check after the reset timeout
//! HalfOpen -> Closed    the single trial succeeds
//! HalfOpen -> Open      the single trial fails, timeout restarts
//! ```
//!
//! The breaker is the only writer of its server's `circuit_state` and `is_down`
//! flags. Every transition takes an explicit `now` so it can be driven without
//! timers or network I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::topology::{CircuitState, Server, Topology};

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub error_threshold_percentage: u8,
    pub reset_timeout: Duration,
    pub window_size: usize,
    pub minimum_calls: usize,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            error_threshold_percentage: config.error_threshold_percentage,
            reset_timeout: config.reset_timeout,
            window_size: config.window_size.max(1),
            minimum_calls: config.minimum_calls.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    server: Arc<Server>,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(server: Arc<Server>, settings: BreakerSettings) -> Self {
        server.set_circuit_state(CircuitState::Closed);
        Self {
            server,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(settings.window_size),
                opened_at: None,
                trial_in_flight: false,
            }),
            settings,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[cfg(test)]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Asks to send one call. `None` means fail fast.
    pub fn try_acquire(self: &Arc<Self>, now: Instant) -> Option<Permit> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit::new(self.clone(), false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or_default();
                if elapsed < self.settings.reset_timeout {
                    return None;
                }
                self.apply(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Some(Permit::new(self.clone(), true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Permit::new(self.clone(), true))
                }
            }
        }
    }

    fn on_success(&self, trial: bool) -> Option<Transition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed if !trial => {
                self.push_outcome(&mut inner, true);
                None
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.outcomes.clear();
                inner.opened_at = None;
                let transition = self.apply(&mut inner, CircuitState::Closed);
                self.server.set_down(false);
                info!("Circuit closed for {}, trial call succeeded", self.server.domain);
                transition
            }
            // Outcome of a call admitted before the last transition.
            _ => None,
        }
    }

    fn on_failure(&self, trial: bool, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed if !trial => {
                self.push_outcome(&mut inner, false);
                if !self.threshold_exceeded(&inner) {
                    return None;
                }
                inner.opened_at = Some(now);
                let transition = self.apply(&mut inner, CircuitState::Open);
                self.server.set_down(true);
                warn!(
                    "Circuit opened for {} after {} failures in {} calls",
                    self.server.domain,
                    inner.outcomes.iter().filter(|ok| !**ok).count(),
                    inner.outcomes.len()
                );
                transition
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(now);
                let transition = self.apply(&mut inner, CircuitState::Open);
                self.server.set_down(true);
                warn!("Circuit re-opened for {}, trial call failed", self.server.domain);
                transition
            }
            _ => None,
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, ok: bool) {
        inner.outcomes.push_back(ok);
        while inner.outcomes.len() > self.settings.window_size {
            inner.outcomes.pop_front();
        }
    }

    fn threshold_exceeded(&self, inner: &BreakerInner) -> bool {
        let recorded = inner.outcomes.len();
        if recorded < self.settings.minimum_calls {
            return false;
        }
        let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
        failures * 100 >= self.settings.error_threshold_percentage as usize * recorded
    }

    fn apply(&self, inner: &mut BreakerInner, to: CircuitState) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        self.server.set_circuit_state(to);
        Some(Transition { from, to })
    }
}

/// Admission to call a server through its breaker.
///
/// Resolve it with [`Permit::succeed`] or [`Permit::fail`]. A trial permit
/// dropped unresolved frees the trial slot for the next caller.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl Permit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    #[cfg(test)]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) -> Option<Transition> {
        self.resolved = true;
        self.breaker.on_success(self.trial)
    }

    pub fn fail(mut self, now: Instant) -> Option<Transition> {
        self.resolved = true;
        self.breaker.on_failure(self.trial, now)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Breakers for every configured server, keyed by region and domain.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: HashMap<(String, String), Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(topology: &Topology, settings: &BreakerSettings) -> Self {
        let breakers = topology
            .servers()
            .map(|(region, server)| {
                (
                    (region.name.clone(), server.domain.clone()),
                    Arc::new(CircuitBreaker::new(server.clone(), settings.clone())),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, region: &str, domain: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(&(region.to_string(), domain.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(window: usize, minimum: usize) -> Arc<CircuitBreaker> {
        let server = Arc::new(Server::new("http://a", 1));
        Arc::new(CircuitBreaker::new(
            server,
            BreakerSettings {
                error_threshold_percentage: 50,
                reset_timeout: Duration::from_secs(30),
                window_size: window,
                minimum_calls: minimum,
            },
        ))
    }

    fn call(breaker: &Arc<CircuitBreaker>, ok: bool, now: Instant) -> Option<Transition> {
        let permit = breaker.try_acquire(now).expect("permit");
        if ok {
            permit.succeed()
        } else {
            permit.fail(now)
        }
    }

    #[test]
    fn test_opens_when_failure_rate_reaches_threshold() {
        let breaker = breaker(4, 4);
        let now = Instant::now();

        assert_eq!(call(&breaker, true, now), None);
        assert_eq!(call(&breaker, true, now), None);
        assert_eq!(call(&breaker, false, now), None);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let transition = call(&breaker, false, now).unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(breaker.server().is_down());
        assert_eq!(breaker.server().circuit_state(), CircuitState::Open);
        // Still scored as healthy, but out of the live set.
        assert_eq!(breaker.server().health_score(), 100);
        assert!(!breaker.server().is_live(30));
    }

    #[test]
    fn test_open_fails_fast_until_reset_timeout() {
        let breaker = breaker(1, 1);
        let now = Instant::now();
        call(&breaker, false, now);

        assert!(breaker.try_acquire(now + Duration::from_secs(29)).is_none());
        let permit = breaker.try_acquire(now + Duration::from_secs(30)).unwrap();
        assert!(permit.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let breaker = breaker(1, 1);
        let now = Instant::now();
        call(&breaker, false, now);

        let later = now + Duration::from_secs(31);
        let trial = breaker.try_acquire(later).unwrap();
        assert!(breaker.try_acquire(later).is_none());
        assert!(breaker.try_acquire(later).is_none());

        let transition = trial.succeed().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert!(!breaker.server().is_down());
        assert!(breaker.try_acquire(later).is_some());
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_timeout() {
        let breaker = breaker(1, 1);
        let now = Instant::now();
        call(&breaker, false, now);

        let later = now + Duration::from_secs(31);
        let transition = breaker.try_acquire(later).unwrap().fail(later).unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(breaker.server().is_down());

        assert!(breaker.try_acquire(later + Duration::from_secs(29)).is_none());
        assert!(breaker.try_acquire(later + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let breaker = breaker(1, 1);
        let now = Instant::now();
        call(&breaker, false, now);

        let later = now + Duration::from_secs(31);
        drop(breaker.try_acquire(later).unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(later).unwrap().is_trial());
    }

    #[test]
    fn test_window_forgets_old_failures() {
        let breaker = breaker(4, 4);
        let now = Instant::now();
        call(&breaker, false, now);
        for _ in 0..3 {
            call(&breaker, true, now);
        }
        // Window is [F, S, S, S]; the oldest failure rolls out next.
        call(&breaker, true, now);
        call(&breaker, false, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_outcome_after_open_is_ignored() {
        let breaker = breaker(1, 1);
        let now = Instant::now();
        let early = breaker.try_acquire(now).unwrap();
        call(&breaker, false, now);
        assert_eq!(early.succeed(), None);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
