//! # Core Types Module
//!
//! Request, response and identity types shared by the dispatcher, the HTTP
//! surface and the collaborators (verifier, limiter, forwarder).
//!
//! ## Ownership Notes
//!
//! - `Bytes` bodies are reference counted, so cloning a request or response
//!   for logging or retries never copies the payload
//! - `Principal` is built once per request and dropped with it; nothing here
//!   is cached across requests

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// An inbound request as seen by the gateway, detached from the HTTP server.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Unique identifier for this request (propagated upstream as `x-request-id`)
    pub id: String,

    pub method: Method,

    /// Request URI including path and query
    pub uri: Uri,

    pub headers: HeaderMap,

    pub body: Bytes,

    /// Caller's network address
    pub remote_addr: SocketAddr,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl GatewayRequest {
    /// Create a new request with a generated ID
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body,
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name, ignoring values that are not valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Bearer token from the `Authorization` header, if any
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
            Some(token.trim())
        } else {
            None
        }
    }
}

/// A response produced by the gateway, either relayed from upstream or
/// generated locally (errors, fallback).
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Build a JSON response. Serialization of a `serde_json::Value` cannot fail.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    /// Parse the body as JSON (used by tests and the admin surface)
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Status, headers and body are passed through as they are; repeated
/// headers such as `set-cookie` keep every value.
impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// The authenticated caller for one request.
///
/// Authorities are derived solely from the verified claim set presented with
/// the request.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Principal {
    pub subject_id: String,
    pub username: String,
    pub authorities: BTreeSet<String>,
}

impl Principal {
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }

    /// True when the principal holds at least one of `required`
    pub fn has_any_authority<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().any(|a| self.authorities.contains(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: &str) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", value.parse().unwrap());
        GatewayRequest::new(
            Method::GET,
            "/api/parcel/1?x=1".parse().unwrap(),
            headers,
            Bytes::new(),
            "10.0.0.7:4321".parse().unwrap(),
        )
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(request_with_auth("Bearer abc.def").bearer_token(), Some("abc.def"));
        assert_eq!(request_with_auth("bearer abc").bearer_token(), Some("abc"));
        assert_eq!(request_with_auth("Basic dXNlcg==").bearer_token(), None);
        assert_eq!(request_with_auth("Bearer ").bearer_token(), None);
    }

    #[test]
    fn test_path_and_query() {
        let request = request_with_auth("Bearer t");
        assert_eq!(request.path(), "/api/parcel/1");
        assert_eq!(request.query(), Some("x=1"));
        assert!(!request.id.is_empty());
    }

    #[test]
    fn test_repeated_headers_survive_into_response() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "session=abc; Path=/".parse().unwrap());
        headers.append("set-cookie", "theme=dark; Path=/".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        let response =
            GatewayResponse::new(StatusCode::CREATED, headers, Bytes::from_static(b"ok"))
                .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["session=abc; Path=/", "theme=dark; Path=/"]);
        assert_eq!(response.headers()["content-type"], "text/plain");
    }

    #[test]
    fn test_principal_any_authority() {
        let principal = Principal {
            subject_id: "u-1".into(),
            username: "alice".into(),
            authorities: ["ROLE_USER".to_string()].into_iter().collect(),
        };
        let admin = vec!["ROLE_ADMIN".to_string()];
        let either = vec!["ROLE_ADMIN".to_string(), "ROLE_USER".to_string()];
        assert!(!principal.has_any_authority(&admin));
        assert!(principal.has_any_authority(&either));
        assert!(principal.has_authority("ROLE_USER"));
    }
}
