pub mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub use metrics::MetricsCollector;

/// Installs the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", config.level, e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
