use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::admission::RateLimiter;
use crate::config::AdminConfig;
use crate::error::{BalancerError, Result};
use crate::proxy::cache::ResponseCache;
use crate::topology::{ServerSnapshot, Topology};

/// Read-only status API on its own port
pub struct AdminServer {
    config: AdminConfig,
    state: AdminState,
}

#[derive(Clone)]
struct AdminState {
    topology: Arc<Topology>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl AdminServer {
    pub fn new(
        config: &AdminConfig,
        topology: Arc<Topology>,
        cache: Arc<ResponseCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config: config.clone(),
            state: AdminState {
                topology,
                cache,
                limiter,
            },
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/api/servers", get(get_servers))
            .route("/api/cache", get(get_cache_statistics).delete(clear_cache))
            .route("/api/rate-limit", get(get_rate_limit_statistics))
            .with_state(self.state.clone())
    }

    pub async fn start(&self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BalancerError::Internal(format!("Failed to bind admin server: {}", e)))?;

        info!("Admin server listening on {}", addr);

        axum::serve(listener, self.router())
            .await
            .map_err(|e| BalancerError::Internal(format!("Admin server error: {}", e)))?;

        Ok(())
    }
}

async fn get_servers(State(state): State<AdminState>) -> impl IntoResponse {
    let servers: Vec<ServerSnapshot> = state.topology.snapshot();
    Json(ApiResponse::success(servers))
}

async fn get_cache_statistics(State(state): State<AdminState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.cache.get_statistics().await))
}

async fn get_rate_limit_statistics(State(state): State<AdminState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.limiter.get_statistics().await))
}

async fn clear_cache(State(state): State<AdminState>) -> impl IntoResponse {
    state.cache.clear().await;
    info!("Cache cleared via admin API");
    Json(ApiResponse::success("Cache cleared"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::{CacheConfig, RateLimitConfig};
    use crate::proxy::ProxyResponse;
    use crate::testing::topology_of;

    fn server() -> AdminServer {
        let topology = Arc::new(topology_of(&[("eu", &["http://a", "http://b"]), ("us", &["http://c"])]));
        let cache = Arc::new(ResponseCache::new(&CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
            max_entries: 10,
        }));
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            max_requests: 2,
            ..Default::default()
        }));
        AdminServer::new(&AdminConfig::default(), topology, cache, limiter)
    }

    async fn call(server: &AdminServer, method: Method, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = server.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_servers_snapshot() {
        let server = server();
        server.state.topology.regions()[0].servers[1].set_down(true);
        server.state.topology.regions()[0].servers[1].set_latency(Some(Duration::from_millis(42)));

        let (status, body) = call(&server, Method::GET, "/api/servers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let servers = body["data"].as_array().unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0]["domain"], "http://a");
        assert_eq!(servers[0]["latencyMs"], Value::Null);
        assert_eq!(servers[0]["healthScore"], 100);
        assert_eq!(servers[1]["isDown"], true);
        assert_eq!(servers[1]["latencyMs"], 42);
        assert_eq!(servers[2]["region"], "us");
    }

    #[tokio::test]
    async fn test_cache_statistics_and_clear() {
        let server = server();
        let response = ProxyResponse {
            status: 200,
            headers: Default::default(),
            body: Bytes::from_static(b"cached"),
        };
        server.state.cache.set("GET/a".to_string(), &response).await;

        let (_, body) = call(&server, Method::GET, "/api/cache").await;
        assert_eq!(body["data"]["statistics"]["current_entries"], 1);

        let (status, _) = call(&server, Method::DELETE, "/api/cache").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(server.state.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_statistics() {
        let server = server();
        for _ in 0..3 {
            server.state.limiter.check("203.0.113.9:curl/8", 10.0).await;
        }

        let (status, body) = call(&server, Method::GET, "/api/rate-limit").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["requests"], 3);
        assert_eq!(body["data"]["blocked"], 1);
        assert_eq!(body["data"]["active_windows"], 1);
    }
}
