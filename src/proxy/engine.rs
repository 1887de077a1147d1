use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use tracing::{debug, error, field, info, instrument, warn};

use crate::config::{Config, RetryConfig, StickySessionConfig};
use crate::error::{BalancerError, Result};
use crate::health::HealthTracker;
use crate::observability::MetricsCollector;

use super::cache::ResponseCache;
use super::router::RoutingEngine;
use super::upstream::{is_hop_by_hop_header, BackendClient, BackendRequest};
use super::{InboundRequest, Priority, ProxyResponse, RequestContext};

/// Sticky-session bookkeeping for one request
#[derive(Debug, Default)]
struct StickyState {
    requested: Option<String>,
    cleared: bool,
}

/// Request Pipeline: cache, retry loop across regions, terminal statuses
pub struct RequestPipeline {
    router: Arc<RoutingEngine>,
    tracker: Arc<HealthTracker>,
    backend: Arc<dyn BackendClient>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsCollector>,
    retry: RetryConfig,
    sticky: StickySessionConfig,
}

impl RequestPipeline {
    pub fn new(
        router: Arc<RoutingEngine>,
        tracker: Arc<HealthTracker>,
        backend: Arc<dyn BackendClient>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Self {
        Self {
            router,
            tracker,
            backend,
            cache,
            metrics,
            retry: config.retry.clone(),
            sticky: config.sticky_session.clone(),
        }
    }

    /// Runs one admitted request to completion. Always yields a response.
    #[instrument(
        skip_all,
        fields(request_id = field::Empty, method = field::Empty, uri = field::Empty)
    )]
    pub async fn handle(&self, request: InboundRequest, request_id: String) -> Response {
        let context = RequestContext::new(&request, request_id);

        tracing::Span::current()
            .record("request_id", context.request_id.as_str())
            .record("method", request.method.as_str())
            .record("uri", request.path_and_query());

        debug!(
            "Processing request {} with {} priority",
            context.request_id,
            context.priority.as_str()
        );

        let response = match self.process(&request, &context).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request {} failed: {}", context.request_id, e);
                BalancerError::Internal(e.to_string()).into_response()
            }
        };

        let elapsed = context.start_time.elapsed();
        self.metrics
            .record_request(request.method.as_str(), response.status().as_u16(), elapsed);
        debug!(
            "Completed request {} with {} in {}ms",
            context.request_id,
            response.status(),
            elapsed.as_millis()
        );

        response
    }

    async fn process(&self, request: &InboundRequest, context: &RequestContext) -> Result<Response> {
        let cacheable = self.cache.is_enabled() && request.method == Method::GET;
        if cacheable {
            if let Some(cached) = self.cache.get(&context.cache_key).await {
                self.metrics.record_cache(true);
                debug!("Serving cached response for request {}", context.request_id);
                return build_response(cached, Some("HIT"));
            }
            self.metrics.record_cache(false);
        }

        let home = self.router.resolve_region(request).await;
        let payload = if self.router.needs_payload() && !request.body.is_empty() {
            serde_json::from_slice::<serde_json::Value>(&request.body).ok()
        } else {
            None
        };
        let mut sticky = StickyState {
            requested: self
                .sticky
                .enabled
                .then(|| request.cookie(&self.sticky.cookie_name))
                .flatten(),
            cleared: false,
        };
        let backend_request = BackendRequest::new(request, context);

        let regions = self.router.region_order(&home);
        let last_region = regions.len().saturating_sub(1);
        for (index, region) in regions.into_iter().enumerate() {
            for attempt in 1..=self.retry.retries {
                let server = match self.router.select(
                    &region.name,
                    request,
                    sticky.requested.as_deref(),
                    payload.as_ref(),
                ) {
                    Ok(server) => server,
                    Err(e) => {
                        debug!("Attempt {} in {}: {}", attempt, region.name, e);
                        continue;
                    }
                };

                let ticket = match self.tracker.admit(&region.name, &server) {
                    Some(ticket) => ticket,
                    None => {
                        debug!("Circuit open for {}, skipping", server.domain);
                        continue;
                    }
                };

                debug!(
                    "Attempt {} routed request {} to {} in {}",
                    attempt, context.request_id, server.domain, region.name
                );

                let started = std::time::Instant::now();
                match self.backend.send(&server.domain, &backend_request).await {
                    Ok(response) => {
                        self.metrics
                            .record_backend_call(&server.domain, started.elapsed(), true);
                        self.tracker.record_call_success(ticket);

                        if response.status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
                            info!(
                                "Backend {} rate limited request {}, forwarding",
                                server.domain, context.request_id
                            );
                            return build_response(response, None);
                        }

                        if cacheable && response.status == StatusCode::OK.as_u16() {
                            self.cache.set(context.cache_key.clone(), &response).await;
                        }

                        let mut built = build_response(response, cacheable.then_some("MISS"))?;
                        if self.sticky.enabled && (sticky.requested.is_none() || sticky.cleared) {
                            self.append_cookie(&mut built, self.session_cookie(&server.domain))?;
                            debug!("Set sticky session cookie for {}", server.domain);
                        }
                        return Ok(built);
                    }
                    Err(e) => {
                        self.metrics
                            .record_backend_call(&server.domain, started.elapsed(), false);
                        warn!(
                            "Error proxying request {} to {} in {}: {}",
                            context.request_id, server.domain, region.name, e
                        );

                        if self.tracker.record_failure(&server, ticket) {
                            warn!("Server {} in region {} marked down", server.domain, region.name);
                        }
                        if self.sticky.enabled {
                            sticky.requested = None;
                            sticky.cleared = true;
                        }
                        self.tracker.attempt_heal(&region.name, &server);
                        self.metrics.record_server_state(&server);

                        if index < last_region || attempt < self.retry.retries {
                            tokio::time::sleep(self.retry.delay).await;
                        }
                    }
                }
            }
        }

        let status = match context.priority {
            Priority::High => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::TOO_MANY_REQUESTS,
        };
        error!(
            "Request {} failed after all retries, answering {}",
            context.request_id, status
        );

        let mut response = BalancerError::Exhausted { status }.into_response();
        if sticky.cleared {
            self.append_cookie(&mut response, self.removal_cookie())?;
        }
        Ok(response)
    }

    fn session_cookie(&self, domain: &str) -> Cookie<'static> {
        let max_age = time::Duration::seconds(self.sticky.max_age.as_secs() as i64);
        Cookie::build((self.sticky.cookie_name.clone(), domain.to_string()))
            .path("/")
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Strict)
            .max_age(max_age)
            .build()
    }

    fn removal_cookie(&self) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.sticky.cookie_name.clone(), ""))
            .path("/")
            .build();
        cookie.make_removal();
        cookie
    }

    fn append_cookie(&self, response: &mut Response, cookie: Cookie<'static>) -> Result<()> {
        let value = HeaderValue::from_str(&cookie.to_string())
            .map_err(|e| BalancerError::Internal(format!("Invalid cookie: {}", e)))?;
        response.headers_mut().append(header::SET_COOKIE, value);
        Ok(())
    }
}

fn build_response(proxy_response: ProxyResponse, cache_status: Option<&'static str>) -> Result<Response> {
    let status = StatusCode::from_u16(proxy_response.status)
        .map_err(|e| BalancerError::Internal(format!("Invalid backend status: {}", e)))?;
    let mut builder = Response::builder().status(status);

    for (name, value) in proxy_response.headers.iter() {
        if !is_hop_by_hop_header(name) && name != header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    if let Some(cache_status) = cache_status {
        builder = builder.header("X-Cache", cache_status);
    }

    builder
        .body(Body::from(proxy_response.body))
        .map_err(|e| BalancerError::Internal(format!("Failed to build response: {}", e)))
}
