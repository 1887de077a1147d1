use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::{new_request_id, InboundRequest, Priority, RequestPipeline};
use crate::admission::AdmissionController;
use crate::config::ServerConfig;
use crate::error::{BalancerError, Result};
use crate::lifecycle::Lifecycle;

const HEALTH_PATH: &str = "/health";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub admission: Arc<AdmissionController>,
    pub lifecycle: Arc<Lifecycle>,
}

/// Every path lands on one handler; the balancer owns no routes of its own
/// apart from the liveness check.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .into_inner(),
        )
        .with_state(state)
}

/// Serves until the lifecycle signals shutdown. Connections still open at that
/// point are left to the drain deadline.
pub async fn serve(config: &ServerConfig, app: Router, lifecycle: Arc<Lifecycle>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BalancerError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("Load balancer listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { lifecycle.wait_for_shutdown().await })
        .await
        .map_err(|e| BalancerError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

async fn handle_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        return BalancerError::ShuttingDown.into_response();
    }

    // Held until the response is built, so a request still uploading its body
    // keeps shutdown from reporting a clean drain.
    let request_id = new_request_id();
    let _in_flight = state.lifecycle.track(&request_id);

    if req.method() == Method::GET && req.uri().path() == HEALTH_PATH {
        return (StatusCode::OK, "OK").into_response();
    }

    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let (parts, body) = req.into_parts();
    let mut inbound = InboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body: Bytes::new(),
        client_ip,
    };

    let priority = Priority::from_headers(&inbound.headers);
    if let Some(rejection) = state.admission.admit(&inbound, priority).await.into_error() {
        debug!(
            "Rejected {} {} from {}: {}",
            inbound.method,
            inbound.path(),
            inbound.effective_client_ip(),
            rejection
        );
        return rejection.into_response();
    }

    inbound.body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return BalancerError::BadRequest("unreadable request body".to_string()).into_response();
        }
    };

    state.pipeline.handle(inbound, request_id).await
}
