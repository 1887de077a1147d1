//! Routing Engine: picks one live server for one attempt.
//!
//! Selection order: region resolution, live-set filter, content rules,
//! sticky session, then the balancing algorithm.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ContentRuleConfig, LatencyRoutingConfig, RoutingConfig};
use crate::error::{BalancerError, Result};
use crate::rng::SharedRng;
use crate::topology::{Region, Server, Topology};

use super::geo::GeoLocator;
use super::load_balancer::LoadBalancer;
use super::InboundRequest;

/// A content rule: any of its predicates matching routes to `server`
#[derive(Debug, Clone)]
struct ContentRule {
    server: String,
    path: Option<String>,
    header: Option<(String, String)>,
    payload: Option<(String, serde_json::Value)>,
}

impl ContentRule {
    fn from_config(config: &ContentRuleConfig) -> Self {
        Self {
            server: config.server.clone(),
            path: config.path.clone(),
            header: config
                .header
                .as_ref()
                .map(|h| (h.name.to_ascii_lowercase(), h.value.clone())),
            payload: config
                .payload
                .as_ref()
                .map(|p| (p.field.clone(), p.value.clone())),
        }
    }

    /// Path prefix, then header equality, then body-field equality.
    fn matches(&self, request: &InboundRequest, payload: Option<&serde_json::Value>) -> bool {
        if let Some(prefix) = &self.path {
            if request.path_and_query().starts_with(prefix.as_str()) {
                return true;
            }
        }
        if let Some((name, value)) = &self.header {
            if request.header(name) == Some(value.as_str()) {
                return true;
            }
        }
        if let (Some((field, value)), Some(body)) = (&self.payload, payload) {
            if body.get(field) == Some(value) {
                return true;
            }
        }
        false
    }
}

pub struct RoutingEngine {
    topology: Arc<Topology>,
    default_region: String,
    health_score_threshold: u8,
    rules: Vec<ContentRule>,
    geo: Option<Arc<dyn GeoLocator>>,
    balancer: LoadBalancer,
}

impl RoutingEngine {
    pub fn new(
        topology: Arc<Topology>,
        routing: &RoutingConfig,
        latency_routing: &LatencyRoutingConfig,
        rules: &[ContentRuleConfig],
        geo: Option<Arc<dyn GeoLocator>>,
        rng: SharedRng,
    ) -> Self {
        Self {
            topology,
            default_region: routing.default_region.clone(),
            health_score_threshold: routing.health_score_threshold,
            rules: rules.iter().map(ContentRule::from_config).collect(),
            geo,
            balancer: LoadBalancer::new(routing.algorithm, latency_routing.enabled, rng),
        }
    }

    #[cfg(test)]
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn algorithm(&self) -> &'static str {
        self.balancer.get_type()
    }

    /// Whether any rule inspects the JSON body.
    pub fn needs_payload(&self) -> bool {
        self.rules.iter().any(|r| r.payload.is_some())
    }

    /// The caller's home region. Lookup failures and unconfigured answers fall
    /// back to the default region.
    pub async fn resolve_region(&self, request: &InboundRequest) -> String {
        let geo = match &self.geo {
            Some(geo) => geo,
            None => return self.default_region.clone(),
        };

        let ip = request.effective_client_ip();
        match geo.locate(ip).await {
            Ok(region) if self.topology.region(&region).is_some() => region,
            Ok(region) => {
                warn!("Geo-routing returned unknown region {} for {}, using default", region, ip);
                self.default_region.clone()
            }
            Err(e) => {
                warn!("Geo-routing lookup failed for {}: {}, using default", ip, e);
                self.default_region.clone()
            }
        }
    }

    /// Home region first, then the rest in configured order.
    pub fn region_order<'a>(&'a self, home: &str) -> Vec<&'a Region> {
        let mut order: Vec<&Region> = self.topology.region(home).into_iter().collect();
        order.extend(self.topology.regions().iter().filter(|r| r.name != home));
        order
    }

    /// Selects a server in `region` for one attempt.
    pub fn select(
        &self,
        region: &str,
        request: &InboundRequest,
        sticky: Option<&str>,
        payload: Option<&serde_json::Value>,
    ) -> Result<Arc<Server>> {
        let region = self
            .topology
            .region(region)
            .ok_or_else(|| BalancerError::UnknownRegion(region.to_string()))?;

        let live = region.live_servers(self.health_score_threshold);
        if live.is_empty() {
            return Err(BalancerError::NoServersAvailable {
                region: region.name.clone(),
            });
        }

        for rule in &self.rules {
            if !rule.matches(request, payload) {
                continue;
            }
            if let Some(server) = live.iter().find(|s| s.domain == rule.server) {
                debug!("Content-based routing selected {}", server.domain);
                return Ok(server.clone());
            }
        }

        if let Some(domain) = sticky {
            if let Some(server) = live.iter().find(|s| s.domain == domain) {
                debug!("Sticky session selected {}", server.domain);
                return Ok(server.clone());
            }
        }

        self.balancer
            .select(&live)
            .ok_or_else(|| BalancerError::NoServersAvailable {
                region: region.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use axum::http::{HeaderMap, HeaderValue, Method};
    use bytes::Bytes;

    use crate::config::{Algorithm, HeaderMatchConfig, PayloadMatchConfig};
    use crate::testing::{topology_of, StaticGeo};
    use crate::topology::CircuitState;

    fn request(path: &str, headers: &[(&'static str, &'static str)]) -> InboundRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        InboundRequest {
            method: Method::GET,
            uri: path.parse().unwrap(),
            headers: map,
            body: Bytes::new(),
            client_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)),
        }
    }

    fn engine(rules: Vec<ContentRuleConfig>, geo: Option<Arc<dyn GeoLocator>>) -> RoutingEngine {
        let topology = Arc::new(topology_of(&[
            ("us-east", &["http://a", "http://b", "http://c"]),
            ("eu-west", &["http://d"]),
        ]));
        RoutingEngine::new(
            topology,
            &RoutingConfig {
                algorithm: Algorithm::RoundRobin,
                ..Default::default()
            },
            &LatencyRoutingConfig::default(),
            &rules,
            geo,
            SharedRng::new(Some(5)),
        )
    }

    fn rule(server: &str) -> ContentRuleConfig {
        ContentRuleConfig {
            server: server.to_string(),
            path: None,
            header: None,
            payload: None,
        }
    }

    #[test]
    fn test_live_filter_excludes_down_low_score_and_open() {
        let engine = engine(vec![], None);
        let region = &engine.topology().regions()[0];
        region.servers[0].set_down(true);
        region.servers[1].set_health_score(30);

        let req = request("/", &[]);
        for _ in 0..4 {
            assert_eq!(engine.select("us-east", &req, None, None).unwrap().domain, "http://c");
        }

        region.servers[2].set_circuit_state(CircuitState::Open);
        let err = engine.select("us-east", &req, None, None).unwrap_err();
        assert!(matches!(err, BalancerError::NoServersAvailable { .. }));
    }

    #[test]
    fn test_unknown_region() {
        let engine = engine(vec![], None);
        let err = engine.select("ap-south", &request("/", &[]), None, None).unwrap_err();
        assert!(matches!(err, BalancerError::UnknownRegion(_)));
    }

    #[test]
    fn test_content_rules_in_order() {
        let mut by_path = rule("http://b");
        by_path.path = Some("/api".to_string());
        let mut by_header = rule("http://c");
        by_header.header = Some(HeaderMatchConfig {
            name: "X-Tenant".to_string(),
            value: "gold".to_string(),
        });
        let mut by_payload = rule("http://a");
        by_payload.payload = Some(PayloadMatchConfig {
            field: "tier".to_string(),
            value: serde_json::json!("batch"),
        });
        let engine = engine(vec![by_path, by_header, by_payload], None);
        assert!(engine.needs_payload());

        let api = request("/api/orders", &[("x-tenant", "gold")]);
        assert_eq!(engine.select("us-east", &api, None, None).unwrap().domain, "http://b");

        let tenant = request("/shop", &[("x-tenant", "gold")]);
        assert_eq!(engine.select("us-east", &tenant, None, None).unwrap().domain, "http://c");

        let body = serde_json::json!({ "tier": "batch" });
        let batch = request("/jobs", &[]);
        assert_eq!(
            engine.select("us-east", &batch, None, Some(&body)).unwrap().domain,
            "http://a"
        );
    }

    #[test]
    fn test_content_rule_target_must_be_live() {
        let mut by_path = rule("http://b");
        by_path.path = Some("/api".to_string());
        let engine = engine(vec![by_path], None);
        engine.topology().regions()[0].servers[1].set_down(true);

        let req = request("/api", &[]);
        let picks: Vec<_> = (0..2)
            .map(|_| engine.select("us-east", &req, None, None).unwrap().domain.clone())
            .collect();
        assert_eq!(picks, vec!["http://a", "http://c"]);
    }

    #[test]
    fn test_sticky_scoped_to_live_set() {
        let engine = engine(vec![], None);
        let req = request("/", &[]);

        for _ in 0..3 {
            let server = engine.select("us-east", &req, Some("http://c"), None).unwrap();
            assert_eq!(server.domain, "http://c");
        }

        // A server from another region is not honoured.
        let server = engine.select("us-east", &req, Some("http://d"), None).unwrap();
        assert_ne!(server.domain, "http://d");

        engine.topology().regions()[0].servers[2].set_down(true);
        let server = engine.select("us-east", &req, Some("http://c"), None).unwrap();
        assert_ne!(server.domain, "http://c");
    }

    #[tokio::test]
    async fn test_resolve_region_uses_geo_and_falls_back() {
        let req = request("/", &[]);

        let no_geo = engine(vec![], None);
        assert_eq!(no_geo.resolve_region(&req).await, "us-east");

        let eu = engine(vec![], Some(Arc::new(StaticGeo::answering("eu-west"))));
        assert_eq!(eu.resolve_region(&req).await, "eu-west");

        let unknown = engine(vec![], Some(Arc::new(StaticGeo::answering("mars"))));
        assert_eq!(unknown.resolve_region(&req).await, "us-east");

        let failing = engine(vec![], Some(Arc::new(StaticGeo::failing())));
        assert_eq!(failing.resolve_region(&req).await, "us-east");
    }

    #[test]
    fn test_region_order_starts_at_home() {
        let engine = engine(vec![], None);
        let order: Vec<_> = engine.region_order("eu-west").iter().map(|r| r.name.clone()).collect();
        assert_eq!(order, vec!["eu-west", "us-east"]);

        let order: Vec<_> = engine.region_order("us-east").iter().map(|r| r.name.clone()).collect();
        assert_eq!(order, vec!["us-east", "eu-west"]);
    }
}
