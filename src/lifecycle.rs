//! In-flight tracking and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    TimedOut { remaining: usize },
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Drained => 0,
            ShutdownOutcome::TimedOut { .. } => 1,
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    in_flight: DashSet<String>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            in_flight: DashSet::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Registers a request until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, request_id: &str) -> InFlightGuard {
        self.in_flight.insert(request_id.to_string());
        InFlightGuard {
            lifecycle: self.clone(),
            request_id: request_id.to_string(),
        }
    }

    /// Stops admitting requests and wakes everything waiting on shutdown.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Shutdown started with {} request(s) in flight", self.in_flight());
            self.shutdown_tx.send_replace(true);
        }
    }

    /// Resolves once shutdown has begun.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Waits for the in-flight set to empty, at most `grace`.
    pub async fn drain(&self, grace: Duration) -> ShutdownOutcome {
        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                info!("All in-flight requests drained");
                return ShutdownOutcome::Drained;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Graceful shutdown timed out after {:?} with {} request(s) in flight",
                    grace, remaining
                );
                return ShutdownOutcome::TimedOut { remaining };
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }
}

/// Removes its request from the in-flight set on drop
#[derive(Debug)]
pub struct InFlightGuard {
    lifecycle: Arc<Lifecycle>,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.lifecycle.in_flight.remove(&self.request_id);
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
