use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{CpuExt, System, SystemExt};
use tracing::debug;

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Current system load as a percentage in `0.0..=100.0`.
pub trait LoadSampler: Send + Sync {
    fn current_load(&self) -> f64;
}

/// Global CPU utilisation, refreshed by a background task.
#[derive(Debug, Default)]
pub struct SystemLoadSampler {
    load_bits: AtomicU64,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, load: f64) {
        self.load_bits
            .store(load.clamp(0.0, 100.0).to_bits(), Ordering::Release);
    }

    /// Samples CPU usage every `period`. The first reading needs two refreshes.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut system = System::new();
            system.refresh_cpu();
            let mut interval = tokio::time::interval(period.max(MIN_SAMPLE_INTERVAL));
            interval.tick().await;
            loop {
                interval.tick().await;
                system.refresh_cpu();
                let usage = system.global_cpu_info().cpu_usage() as f64;
                debug!("System load {:.1}%", usage);
                sampler.store(usage);
            }
        });
    }
}

impl LoadSampler for SystemLoadSampler {
    fn current_load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Acquire))
    }
}
