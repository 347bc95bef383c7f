//! # Error Handling Module
//!
//! Every failure the gateway can surface to a caller is a `GatewayError`
//! variant. The dispatcher never lets one escape as a fault: each variant maps
//! to a status code and a JSON body of the shape
//! `{"error": ..., "message": ..., "status": ...}`.
//!
//! ## Rust Error Handling Concepts
//!
//! - `thiserror` derives `Display` and `Error` from the `#[error("...")]` attributes
//! - Constructor helpers (`GatewayError::unauthenticated(..)`) keep call sites short
//! - `From` impls let `?` lift I/O and parse errors into the gateway taxonomy
//! - `IntoResponse` lets axum handlers return `GatewayError` directly

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::GatewayResponse;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Title used by the fallback contract for every "target unavailable" outcome
pub const FALLBACK_ERROR: &str = "Service temporarily unavailable";

/// Detail message of the fallback contract
pub const FALLBACK_MESSAGE: &str =
    "The requested service is currently down. Please try again later.";

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Request path refused before policy lookup
    #[error("Rejected request path: {reason}")]
    BadRequest { reason: String },

    /// No verified claim set where one is required
    #[error("Authentication required: {reason}")]
    Unauthenticated { reason: String },

    /// Authenticated, but lacking a required authority
    #[error("Access denied: {reason}")]
    Unauthorized { reason: String },

    /// The external limiter rejected the request
    #[error("Rate limit exceeded for key bucket")]
    RateLimited { retry_after: Option<Duration> },

    /// The route's circuit breaker rejected the call
    #[error("Circuit breaker open for route: {route}")]
    CircuitOpen { route: String },

    /// The forwarded call errored before producing a response
    #[error("Upstream failure on route {route}: {reason}")]
    UpstreamFailure { route: String, reason: String },

    /// The forwarded call exceeded the route's call timeout
    #[error("Upstream call on route {route} timed out after {timeout_ms}ms")]
    UpstreamTimeout { route: String, timeout_ms: u64 },

    /// Authorized request that no route can serve
    #[error("No route for path: {path}")]
    RouteNotFound { path: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn bad_request<S: Into<String>>(reason: S) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn unauthenticated<S: Into<String>>(reason: S) -> Self {
        Self::Unauthenticated {
            reason: reason.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn upstream<S: Into<String>>(route: S, reason: S) -> Self {
        Self::UpstreamFailure {
            route: route.into(),
            reason: reason.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code returned to the caller for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Unauthorized { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is answered with the fixed fallback body
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::UpstreamFailure { .. } | Self::UpstreamTimeout { .. }
        )
    }

    /// Short title used as the `error` field of the response body
    pub fn title(&self) -> &'static str {
        match self {
            _ if self.is_fallback() => FALLBACK_ERROR,
            Self::Unauthenticated { .. } => "Unauthorized",
            Self::Unauthorized { .. } => "Forbidden",
            Self::RateLimited { .. } => "Too Many Requests",
            Self::RouteNotFound { .. } => "Not Found",
            Self::BadRequest { .. } | Self::Json { .. } => "Bad Request",
            _ => "Internal Server Error",
        }
    }

    /// Render the error as the JSON response the caller receives
    pub fn to_response(&self) -> GatewayResponse {
        let status = self.status_code();
        let message = if self.is_fallback() {
            FALLBACK_MESSAGE.to_string()
        } else {
            self.to_string()
        };
        let mut response = GatewayResponse::json(
            status,
            &json!({
                "error": self.title(),
                "message": message,
                "status": status.as_u16(),
            }),
        );

        if let Self::RateLimited { retry_after } = self {
            response
                .headers
                .insert("x-ratelimit-remaining", axum::http::HeaderValue::from_static("0"));
            if let Some(retry_after) = retry_after {
                let secs = (retry_after.as_secs_f64().ceil() as u64).max(1);
                response
                    .headers
                    .insert(axum::http::header::RETRY_AFTER, secs.into());
            }
        }
        response
    }
}

/// The fixed fallback response returned instead of contacting an unavailable target
pub fn fallback_response() -> GatewayResponse {
    GatewayResponse::json(
        StatusCode::SERVICE_UNAVAILABLE,
        &json!({
            "error": FALLBACK_ERROR,
            "message": FALLBACK_MESSAGE,
            "status": 503,
        }),
    )
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response().into_response()
    }
}
