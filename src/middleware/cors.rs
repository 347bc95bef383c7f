//! Cross-origin policy at the gateway edge, built on `tower_http::cors`.
//!
//! Credentials cannot be combined with wildcard origins or headers, so
//! "any" is expressed by mirroring the request's own values.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::core::config::CorsConfig;

pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins = if config.allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| parse_or_warn(origin, "origin", |o| HeaderValue::from_str(o).ok())),
        )
    };

    let methods = AllowMethods::list(
        config
            .allowed_methods
            .iter()
            .filter_map(|method| parse_or_warn(method, "method", |m| Method::from_bytes(m.as_bytes()).ok())),
    );

    let headers = if config.allowed_headers.is_empty() {
        AllowHeaders::mirror_request()
    } else {
        AllowHeaders::list(
            config
                .allowed_headers
                .iter()
                .filter_map(|header| parse_or_warn(header, "header", |h| HeaderName::from_bytes(h.as_bytes()).ok())),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(config.allow_credentials)
        .max_age(config.max_age)
}

fn parse_or_warn<T>(raw: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(raw);
    if parsed.is_none() {
        warn!(value = %raw, kind = %kind, "Ignoring invalid CORS entry");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn app(config: &CorsConfig) -> Router {
        Router::new()
            .route("/api/thing", get(|| async { "ok" }))
            .layer(cors_layer(config))
    }

    #[tokio::test]
    async fn test_preflight_mirrors_origin_with_credentials() {
        let response = app(&CorsConfig::default())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/thing")
                    .header("origin", "https://app.example.com")
                    .header("access-control-request-method", "PUT")
                    .header("access-control-request-headers", "x-custom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers["access-control-allow-origin"],
            "https://app.example.com"
        );
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert_eq!(headers["access-control-max-age"], "3600");
        assert_eq!(headers["access-control-allow-headers"], "x-custom");
        assert!(headers["access-control-allow-methods"]
            .to_str()
            .unwrap()
            .contains("DELETE"));
    }

    #[tokio::test]
    async fn test_explicit_origin_list() {
        let config = CorsConfig {
            allowed_origins: vec!["https://ok.example.com".to_string()],
            ..CorsConfig::default()
        };
        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/api/thing")
                    .header("origin", "https://other.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
