//! # Upstream Forwarding
//!
//! The dispatcher hands authorized requests to a [`Forwarder`].
//! [`HttpForwarder`] relays them over HTTP with `reqwest`, copying method,
//! body and end-to-end headers. The call timeout is applied by the caller;
//! dropping the returned future cancels the in-flight request.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, GatewayResponse};
use crate::gateway::routes::Route;

/// Headers that describe a single connection and are never relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Failed to connect to upstream: {0}")]
    Connect(String),

    #[error("Upstream request failed: {0}")]
    Request(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
}

/// Relays a request to the route's target
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError>;
}

pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// `x-forwarded-for` with the caller appended to any existing chain
fn forwarded_for(request: &GatewayRequest) -> String {
    let caller = request.remote_addr.ip().to_string();
    match request.header("x-forwarded-for") {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, caller),
        _ => caller,
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        let url = route.upstream_url(request.path(), request.query());
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ForwardError::Request(format!("Unsupported method: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in request.headers.iter() {
            let name = name.as_str();
            if is_hop_by_hop(name) || name == "host" || name == "content-length" || name == "x-forwarded-for" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&request.id) {
            headers.insert("x-request-id", value);
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&forwarded_for(request)) {
            headers.insert("x-forwarded-for", value);
        }

        debug!(route = %route.id, url = %url, method = %request.method, "Forwarding request upstream");

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ForwardError::Connect(e.to_string())
                } else {
                    ForwardError::Request(e.to_string())
                }
            })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| ForwardError::InvalidResponse(e.to_string()))?;

        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let body: Bytes = response
            .bytes()
            .await
            .map_err(|e| ForwardError::InvalidResponse(format!("Failed to read body: {}", e)))?;

        Ok(GatewayResponse::new(status, response_headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Uri};
    use std::net::SocketAddr;

    fn request(xff: Option<&str>) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        if let Some(value) = xff {
            headers.insert("x-forwarded-for", HeaderValue::from_str(value).unwrap());
        }
        GatewayRequest::new(
            Method::GET,
            Uri::from_static("/"),
            headers,
            Bytes::new(),
            "192.168.1.9:4000".parse::<SocketAddr>().unwrap(),
        )
    }

    #[test]
    fn test_forwarded_for_chain() {
        assert_eq!(forwarded_for(&request(None)), "192.168.1.9");
        assert_eq!(forwarded_for(&request(Some("1.1.1.1"))), "1.1.1.1, 192.168.1.9");
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("authorization"));
    }
}
