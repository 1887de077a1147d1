use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub retry: RetryConfig,
    pub health_check: HealthCheckConfig,
    pub alerts: AlertConfig,
    pub self_healing: SelfHealingConfig,
    pub sticky_session: StickySessionConfig,
    pub cache: CacheConfig,
    pub geo_routing: GeoRoutingConfig,
    pub latency_routing: LatencyRoutingConfig,
    pub rate_limit: RateLimitConfig,
    pub prioritization: PrioritizationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub regions: Vec<RegionConfig>,
    pub content_rules: Vec<ContentRuleConfig>,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub admin: AdminConfig,
    /// Seed for weighted selection and self-healing draws. Random when absent.
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            request_timeout: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Algorithm {
    #[serde(rename = "rr", alias = "round_robin")]
    RoundRobin,
    #[serde(rename = "wrr", alias = "weighted_round_robin")]
    WeightedRoundRobin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub algorithm: Algorithm,
    pub default_region: String,
    /// Servers at or below this score are excluded from routing.
    pub health_score_threshold: u8,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            default_region: "us-east".to_string(),
            health_score_threshold: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub retries: u32,
    #[serde(with = "duration_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub ping_retries: u32,
    #[serde(with = "duration_serde")]
    pub ping_retry_delay: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/ping".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            ping_retries: 3,
            ping_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub server_failure_streak: u32,
    pub region_failure_streak: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            server_failure_streak: 3,
            region_failure_streak: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelfHealingConfig {
    pub enabled: bool,
    pub probability: f64,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StickySessionConfig {
    pub enabled: bool,
    pub cookie_name: String,
    #[serde(with = "duration_serde")]
    pub max_age: Duration,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: "SERVERID".to_string(),
            max_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GeoRoutingConfig {
    pub enabled: bool,
    pub service_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LatencyRoutingConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for LatencyRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    pub max_requests: u32,
    /// Load percentage above which the ceiling drops to 75%.
    pub moderate_load: f64,
    /// Load percentage above which the ceiling drops to 50%.
    pub high_load: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            moderate_load: 50.0,
            high_load: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    /// Low-priority requests are shed while system load exceeds this percentage.
    pub low_priority_max_load: f64,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            low_priority_max_load: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub error_threshold_percentage: u8,
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
    pub window_size: usize,
    pub minimum_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            window_size: 10,
            minimum_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionConfig {
    pub name: String,
    pub servers: Vec<BackendServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendServerConfig {
    pub domain: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A content-based routing rule. Predicates are checked path, header, payload.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ContentRuleConfig {
    pub server: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub header: Option<HeaderMatchConfig>,
    #[serde(default)]
    pub payload: Option<PayloadMatchConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PayloadMatchConfig {
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8081,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.retry.retries == 0 {
            anyhow::bail!("Retry count must be at least one");
        }

        if self.regions.is_empty() {
            anyhow::bail!("At least one region must be configured");
        }

        let mut region_names = HashSet::new();
        for region in &self.regions {
            if !region_names.insert(region.name.as_str()) {
                anyhow::bail!("Duplicate region name: {}", region.name);
            }
            if region.servers.is_empty() {
                anyhow::bail!("Region '{}' must have at least one server", region.name);
            }

            let mut domains = HashSet::new();
            for server in &region.servers {
                if server.domain.is_empty() {
                    anyhow::bail!("Server domain cannot be empty in region '{}'", region.name);
                }
                if !domains.insert(server.domain.as_str()) {
                    anyhow::bail!(
                        "Duplicate server '{}' in region '{}'",
                        server.domain,
                        region.name
                    );
                }
                if server.weight == 0 {
                    anyhow::bail!(
                        "Server weight cannot be zero for '{}' in region '{}'",
                        server.domain,
                        region.name
                    );
                }
            }
        }

        if !region_names.contains(self.routing.default_region.as_str()) {
            anyhow::bail!(
                "Default region '{}' is not configured",
                self.routing.default_region
            );
        }

        if self.routing.health_score_threshold > 100 {
            anyhow::bail!("Health score threshold must be within 0..=100");
        }

        for (index, rule) in self.content_rules.iter().enumerate() {
            if rule.server.is_empty() {
                anyhow::bail!("Content rule #{} has no target server", index);
            }
            if rule.path.is_none() && rule.header.is_none() && rule.payload.is_none() {
                anyhow::bail!("Content rule #{} has no predicate", index);
            }
        }

        if !(0.0..=1.0).contains(&self.self_healing.probability) {
            anyhow::bail!("Self-healing probability must be within 0.0..=1.0");
        }

        let threshold = self.circuit_breaker.error_threshold_percentage;
        if threshold == 0 || threshold > 100 {
            anyhow::bail!("Circuit breaker error threshold must be within 1..=100");
        }
        if self.circuit_breaker.window_size == 0 {
            anyhow::bail!("Circuit breaker window size cannot be zero");
        }

        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            anyhow::bail!("Rate limit max cannot be zero when rate limiting is enabled");
        }

        if self.geo_routing.enabled && self.geo_routing.service_url.is_none() {
            anyhow::bail!("Geo routing is enabled but no service_url is configured");
        }

        Ok(())
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", millis))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            scaled_secs(num, 60, s)
        } else if let Some(num) = s.strip_suffix('h') {
            scaled_secs(num, 3600, s)
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }

    fn scaled_secs(
        num: &str,
        unit: u64,
        original: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let secs = num
            .trim()
            .parse::<u64>()?
            .checked_mul(unit)
            .ok_or_else(|| format!("Duration '{}' is out of range", original))?;
        Ok(Duration::from_secs(secs))
    }
}
