use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("No servers available in region {region}")]
    NoServersAvailable { region: String },

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Request shed under load")]
    Shed,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("All backends exhausted")]
    Exhausted { status: StatusCode },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BalancerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BalancerError::NoServersAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::UnknownRegion(_) => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BalancerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BalancerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BalancerError::Shed => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            BalancerError::Exhausted { status } => *status,
            BalancerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BalancerError::Http(_) => StatusCode::BAD_GATEWAY,
            BalancerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BalancerError::NoServersAvailable { .. } => "NO_SERVERS_AVAILABLE",
            BalancerError::UnknownRegion(_) => "UNKNOWN_REGION",
            BalancerError::Upstream(_) => "UPSTREAM_ERROR",
            BalancerError::Timeout(_) => "TIMEOUT",
            BalancerError::RateLimited => "RATE_LIMIT_EXCEEDED",
            BalancerError::Shed => "LOAD_SHED",
            BalancerError::ShuttingDown => "SHUTTING_DOWN",
            BalancerError::Exhausted { .. } => "BACKENDS_EXHAUSTED",
            BalancerError::BadRequest(_) => "BAD_REQUEST",
            BalancerError::Internal(_) => "INTERNAL_ERROR",
            BalancerError::Http(_) => "HTTP_ERROR",
        }
    }
}

impl IntoResponse for BalancerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        // Internal details stay in the logs.
        let message = match &self {
            BalancerError::Internal(_) => "Internal Server Error".to_string(),
            BalancerError::Exhausted { status } if *status == StatusCode::TOO_MANY_REQUESTS => {
                "Too many requests, please try again later".to_string()
            }
            BalancerError::Exhausted { .. } => "Service unavailable".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();
        if matches!(self, BalancerError::ShuttingDown) {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;
