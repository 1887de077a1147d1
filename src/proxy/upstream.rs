use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use tracing::debug;

use crate::error::{BalancerError, Result};
use super::{InboundRequest, ProxyResponse, RequestContext};

/// What gets forwarded to a backend
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub request_id: String,
}

impl BackendRequest {
    pub fn new(request: &InboundRequest, context: &RequestContext) -> Self {
        Self {
            method: request.method.clone(),
            path_and_query: request.path_and_query().to_string(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            client_ip: request.effective_client_ip().to_string(),
            request_id: context.request_id.clone(),
        }
    }

    /// GET and HEAD are forwarded without a body.
    pub fn forwards_body(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD) && !self.body.is_empty()
    }
}

/// Performs one call to one backend. Transport errors and timeouts are `Err`;
/// any HTTP status is `Ok`.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn send(&self, domain: &str, request: &BackendRequest) -> Result<ProxyResponse>;
}

/// reqwest-backed client used in production
pub struct HttpBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn send(&self, domain: &str, request: &BackendRequest) -> Result<ProxyResponse> {
        let target_url = format!("{}{}", domain.trim_end_matches('/'), request.path_and_query);
        debug!("Forwarding request {} to {}", request.request_id, target_url);

        // reqwest 0.11 is on http 0.2, axum on http 1.x; convert through strings.
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| BalancerError::BadRequest(format!("Invalid method: {}", e)))?;
        let mut builder = self.client.request(method, &target_url);

        for (name, value) in request.headers.iter() {
            if !is_hop_by_hop_header(name) && name != "host" && name != "content-length" {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
        }

        builder = builder
            .header("X-Forwarded-For", request.client_ip.as_str())
            .header("X-Request-ID", request.request_id.as_str());

        if request.forwards_body() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BalancerError::Timeout(format!("{} did not answer within {:?}", domain, self.timeout))
            } else {
                BalancerError::Upstream(format!("Request to {} failed: {}", domain, e))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BalancerError::Upstream(format!("Failed to read response body: {}", e)))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
