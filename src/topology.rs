//! Regions, servers and their live state.
//!
//! Regions and server membership are fixed at startup. Only the live fields of
//! a [`Server`] change at runtime and each of them is an independent atomic, so
//! the health monitor and the request pipeline can write concurrently with
//! last-writer-wins semantics per field.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::RegionConfig;

const LATENCY_UNKNOWN: u64 = u64::MAX;
pub const MAX_HEALTH_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// A backend server and its live state
#[derive(Debug)]
pub struct Server {
    pub domain: String,
    pub weight: u32,
    is_down: AtomicBool,
    latency_ms: AtomicU64,
    health_score: AtomicU8,
    circuit_state: AtomicU8,
}

impl Server {
    pub fn new(domain: impl Into<String>, weight: u32) -> Self {
        Self {
            domain: domain.into(),
            weight,
            is_down: AtomicBool::new(false),
            latency_ms: AtomicU64::new(LATENCY_UNKNOWN),
            health_score: AtomicU8::new(MAX_HEALTH_SCORE),
            circuit_state: AtomicU8::new(CircuitState::Closed.as_u8()),
        }
    }

    pub fn is_down(&self) -> bool {
        self.is_down.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_down(&self, down: bool) -> bool {
        self.is_down.swap(down, Ordering::AcqRel)
    }

    /// `None` until a measurement succeeds.
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Acquire) {
            LATENCY_UNKNOWN => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        let value = latency
            .map(|l| (l.as_millis() as u64).min(LATENCY_UNKNOWN - 1))
            .unwrap_or(LATENCY_UNKNOWN);
        self.latency_ms.store(value, Ordering::Release);
    }

    /// Latency used for ordering; unknown sorts after every measurement.
    pub fn latency_rank(&self) -> u64 {
        self.latency_ms.load(Ordering::Acquire)
    }

    pub fn health_score(&self) -> u8 {
        self.health_score.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn set_health_score(&self, score: u8) {
        self.health_score
            .store(score.min(MAX_HEALTH_SCORE), Ordering::Release);
    }

    /// Applies `delta` clamped to `0..=100` and returns the new score.
    pub fn adjust_health_score(&self, delta: i16) -> u8 {
        let mut current = self.health_score.load(Ordering::Acquire);
        loop {
            let next = (current as i16 + delta).clamp(0, MAX_HEALTH_SCORE as i16) as u8;
            match self.health_score.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from_u8(self.circuit_state.load(Ordering::Acquire))
    }

    pub fn set_circuit_state(&self, state: CircuitState) {
        self.circuit_state.store(state.as_u8(), Ordering::Release);
    }

    /// Eligible for selection: up, score above `threshold`, circuit not open.
    pub fn is_live(&self, threshold: u8) -> bool {
        !self.is_down()
            && self.health_score() > threshold
            && self.circuit_state() != CircuitState::Open
    }

    pub fn snapshot(&self, region: &str) -> ServerSnapshot {
        ServerSnapshot {
            region: region.to_string(),
            domain: self.domain.clone(),
            weight: self.weight,
            is_down: self.is_down(),
            latency_ms: self.latency().map(|l| l.as_millis() as u64),
            health_score: self.health_score(),
            circuit_state: self.circuit_state(),
        }
    }
}

/// Serializable view of a server used by the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub region: String,
    pub domain: String,
    pub weight: u32,
    pub is_down: bool,
    pub latency_ms: Option<u64>,
    pub health_score: u8,
    pub circuit_state: CircuitState,
}

#[derive(Debug)]
pub struct Region {
    pub name: String,
    pub servers: Vec<Arc<Server>>,
}

impl Region {
    /// The live set, in configured order.
    pub fn live_servers(&self, threshold: u8) -> Vec<Arc<Server>> {
        self.servers
            .iter()
            .filter(|s| s.is_live(threshold))
            .cloned()
            .collect()
    }
}

/// All configured regions in configured order
#[derive(Debug)]
pub struct Topology {
    regions: Vec<Region>,
}

impl Topology {
    pub fn from_config(regions: &[RegionConfig]) -> Self {
        let regions = regions
            .iter()
            .map(|region| Region {
                name: region.name.clone(),
                servers: region
                    .servers
                    .iter()
                    .map(|s| Arc::new(Server::new(s.domain.clone(), s.weight)))
                    .collect(),
            })
            .collect();

        Self { regions }
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn servers(&self) -> impl Iterator<Item = (&Region, &Arc<Server>)> {
        self.regions
            .iter()
            .flat_map(|region| region.servers.iter().map(move |server| (region, server)))
    }

    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.servers()
            .map(|(region, server)| server.snapshot(&region.name))
            .collect()
    }
}
