//! # HTTP Server Module
//!
//! The axum surface of the gateway. Everything that is not one of the local
//! endpoints below is converted into a [`GatewayRequest`] and handed to the
//! [`GatewayDispatcher`].
//!
//! Local endpoints:
//! - `GET /actuator/health`, `GET /actuator/info`
//! - `GET /actuator/circuitbreakers` per-route breaker snapshots
//! - `GET /actuator/prometheus` metrics scrape
//! - `/fallback` the fixed fallback body
//!
//! Local endpoints go through the same policy table as proxied requests.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{fallback_response, GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, GatewayResponse};
use crate::gateway::dispatcher::GatewayDispatcher;
use crate::middleware::cors::cors_layer;

/// Shared state of all handlers
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<GatewayDispatcher>,
    pub service_name: String,
    pub max_body_size: usize,
    pub prometheus: Option<PrometheusHandle>,
}

impl ServerState {
    pub fn new(dispatcher: Arc<GatewayDispatcher>, config: &GatewayConfig) -> Self {
        Self {
            dispatcher,
            service_name: config.service.name.clone(),
            max_body_size: config.service.max_body_size,
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Build the full application router
pub fn build_router(state: ServerState, config: &GatewayConfig) -> AxumRouter {
    let local = AxumRouter::new()
        .route("/actuator/health", get(health_check))
        .route("/actuator/info", get(info_handler))
        .route("/actuator/circuitbreakers", get(circuit_breakers))
        .route("/actuator/prometheus", get(prometheus_scrape))
        .route("/fallback", any(fallback))
        .route_layer(middleware::from_fn_with_state(state.clone(), local_endpoint_guard));

    let mut app = AxumRouter::new()
        .merge(local)
        .fallback(handle_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors.enabled {
        app = app.layer(cors_layer(&config.cors));
        info!(
            origins = config.cors.allowed_origins.len(),
            "CORS enabled (empty origin list mirrors any origin)"
        );
    }

    app
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn serve<F>(listener: TcpListener, app: AxumRouter, shutdown: F) -> GatewayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| GatewayError::internal(format!("Failed to read listener address: {}", e)))?;
    info!("Gateway HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))
}

fn remote_addr(request: &Request) -> SocketAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Convert an axum request, buffering the body up to `max_body_size`
async fn into_gateway_request(
    request: Request,
    max_body_size: usize,
) -> Result<GatewayRequest, Response> {
    let remote_addr = remote_addr(&request);
    let (parts, body) = request.into_parts();

    let body = axum::body::to_bytes(body, max_body_size).await.map_err(|e| {
        warn!("Failed to read request body: {}", e);
        GatewayResponse::json(
            StatusCode::PAYLOAD_TOO_LARGE,
            &json!({
                "error": "Payload Too Large",
                "message": format!("Request body exceeds {} bytes", max_body_size),
                "status": StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
            }),
        )
        .into_response()
    })?;

    Ok(GatewayRequest::new(
        parts.method,
        parts.uri,
        parts.headers,
        body,
        remote_addr,
    ))
}

/// Catch-all proxy handler
async fn handle_request(State(state): State<ServerState>, request: Request) -> Response {
    let request = match into_gateway_request(request, state.max_body_size).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    debug!(
        request_id = %request.id,
        method = %request.method,
        path = %request.path(),
        remote_addr = %request.remote_addr,
        "Processing incoming request"
    );
    state.dispatcher.handle(request).await.into_response()
}

/// Authorize local endpoints against the policy table
async fn local_endpoint_guard(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let remote_addr = remote_addr(&request);
    let (parts, body) = request.into_parts();
    let head_only = GatewayRequest::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        bytes::Bytes::new(),
        remote_addr,
    );

    match state.dispatcher.authorize(&head_only).await {
        Ok(_) => next.run(Request::from_parts(parts, body)).await,
        Err(err) => err.into_response(),
    }
}

/// Health check handler
pub async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "status": "UP",
        "service": state.service_name,
    }))
}

pub async fn info_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn circuit_breakers(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.dispatcher.breakers().snapshots())
}

pub async fn prometheus_scrape(State(state): State<ServerState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

pub async fn fallback() -> Response {
    fallback_response().into_response()
}
