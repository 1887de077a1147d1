pub mod cache;
pub mod engine;
pub mod geo;
pub mod load_balancer;
pub mod router;
pub mod server;
pub mod upstream;

use std::net::IpAddr;
use std::time::Instant;

use axum::http::{HeaderMap, Method, Uri};
use axum_extra::extract::cookie::CookieJar;
use bytes::Bytes;
use uuid::Uuid;

pub use engine::RequestPipeline;
pub use router::RoutingEngine;

pub const PRIORITY_HEADER: &str = "x-priority";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Request priority taken from the `x-priority` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Missing or unrecognised values are `Low`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers
            .get(PRIORITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("high") => Priority::High,
            Some("medium") => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

/// An inbound request, fully buffered
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
}

impl InboundRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        CookieJar::from_headers(&self.headers)
            .get(name)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// First `x-forwarded-for` hop, falling back to the peer address.
    pub fn effective_client_ip(&self) -> IpAddr {
        self.header(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.client_ip)
    }

    /// Rate-limiting identity: client address plus user agent.
    pub fn client_key(&self) -> String {
        format!("{}|{}", self.effective_client_ip(), self.user_agent())
    }
}

/// Per-request context, discarded when the request completes
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub priority: Priority,
    pub start_time: Instant,
    pub cache_key: String,
}

/// Opaque 32-character request identifier
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl RequestContext {
    pub fn new(request: &InboundRequest, request_id: String) -> Self {
        Self {
            request_id,
            priority: Priority::from_headers(&request.headers),
            start_time: Instant::now(),
            cache_key: format!("{}{}", request.method, request.path_and_query()),
        }
    }
}

/// Response information, from a backend or the cache
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}
