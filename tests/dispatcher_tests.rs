//! # Dispatcher Integration Tests
//!
//! Drives `GatewayDispatcher::handle` end to end with a stub token verifier
//! and a stub forwarder, covering authorization, rate limiting, routing and
//! circuit breaking.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sparrow_gateway::auth::claims::ClaimSet;
use sparrow_gateway::auth::policy::{AccessConfig, PolicyRuleConfig, PolicyTable};
use sparrow_gateway::auth::verifier::{ClaimVerifier, VerifyError};
use sparrow_gateway::core::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPhase,
};
use sparrow_gateway::core::config::{RateLimitingConfig, RouteDefinition};
use sparrow_gateway::core::error::{FALLBACK_ERROR, FALLBACK_MESSAGE};
use sparrow_gateway::gateway::forwarder::{ForwardError, Forwarder};
use sparrow_gateway::gateway::routes::{Route, RouteTable};
use sparrow_gateway::middleware::rate_limiting::TokenBucketRateLimiter;
use sparrow_gateway::{GatewayConfig, GatewayDispatcher, GatewayRequest, GatewayResponse};

/// Maps raw tokens to claim sets; unknown tokens fail verification
struct StubVerifier {
    tokens: HashMap<String, Value>,
}

#[async_trait]
impl ClaimVerifier for StubVerifier {
    async fn verify(&self, token: &str) -> Result<ClaimSet, VerifyError> {
        self.tokens
            .get(token)
            .cloned()
            .map(ClaimSet::from_value)
            .ok_or(VerifyError::InvalidSignature)
    }
}

#[derive(Clone)]
enum Reply {
    Status(u16),
    Error,
    Hang,
}

/// Answers from a script, repeating the last entry; counts calls
struct StubForwarder {
    script: Mutex<Vec<Reply>>,
    calls: AtomicUsize,
}

impl StubForwarder {
    fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    fn ok() -> Arc<Self> {
        Self::new(vec![Reply::Status(200)])
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Forwarder for StubForwarder {
    async fn forward(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        };
        match reply {
            Reply::Status(code) => Ok(GatewayResponse::json(
                StatusCode::from_u16(code).unwrap(),
                &json!({"route": route.id, "path": request.path()}),
            )),
            Reply::Error => Err(ForwardError::Connect("connection refused".to_string())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(GatewayResponse::json(StatusCode::OK, &json!({})))
            }
        }
    }
}

fn rule(path: &str, methods: &[&str], access: AccessConfig) -> PolicyRuleConfig {
    PolicyRuleConfig {
        path: path.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        access,
    }
}

fn roles(names: &[&str]) -> AccessConfig {
    AccessConfig::HasAnyRole(names.iter().map(|n| n.to_string()).collect())
}

fn policies() -> PolicyTable {
    PolicyTable::from_config(&[
        rule("/api/public/**", &[], AccessConfig::PermitAll),
        rule("/api/admin/**", &[], roles(&["admin"])),
        rule("/api/**", &[], AccessConfig::Authenticated),
        rule("/api/parcel/**", &[], roles(&["ADMIN", "USER"])),
        rule("/api/archive/**", &["DELETE"], AccessConfig::DenyAll),
    ])
    .unwrap()
}

fn routes() -> RouteTable {
    let definition = |id: &str, path: &str| RouteDefinition {
        id: id.to_string(),
        path: path.to_string(),
        upstream: format!("http://{}:8080", id),
        strip_prefix: 0,
        circuit_breaker: None,
    };
    RouteTable::from_definitions(&[
        definition("public-service", "/api/public/**"),
        definition("admin-service", "/api/admin/**"),
        definition("parcel-service", "/api/parcel/**"),
        definition("archive-service", "/api/archive/**"),
    ])
    .unwrap()
}

fn verifier() -> Arc<StubVerifier> {
    let mut tokens = HashMap::new();
    tokens.insert(
        "user-token".to_string(),
        json!({"sub": "u-1", "preferred_username": "uma", "realm_access": {"roles": ["user"]}}),
    );
    tokens.insert(
        "admin-token".to_string(),
        json!({"sub": "a-1", "realm_access": {"roles": ["admin"]}}),
    );
    tokens.insert("no-roles-token".to_string(), json!({"sub": "n-1"}));
    Arc::new(StubVerifier { tokens })
}

fn dispatcher_with(
    forwarder: Arc<StubForwarder>,
    breaker_config: CircuitBreakerConfig,
) -> GatewayDispatcher {
    GatewayDispatcher::new(
        policies(),
        routes(),
        Arc::new(CircuitBreakerRegistry::new(breaker_config, HashMap::new())),
        forwarder,
    )
    .with_verifier(verifier())
}

fn dispatcher(forwarder: Arc<StubForwarder>) -> GatewayDispatcher {
    dispatcher_with(forwarder, CircuitBreakerConfig::default())
}

fn request(method: Method, path: &str, token: Option<&str>) -> GatewayRequest {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
    }
    GatewayRequest::new(
        method,
        path.parse::<Uri>().unwrap(),
        headers,
        Bytes::new(),
        "10.0.0.7:40000".parse::<SocketAddr>().unwrap(),
    )
}

fn get(path: &str, token: Option<&str>) -> GatewayRequest {
    request(Method::GET, path, token)
}

#[tokio::test]
async fn test_public_path_is_forwarded_without_token() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    let response = dispatcher.handle(get("/api/public/status", None)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json_body().unwrap()["route"], "public-service");
    assert_eq!(forwarder.calls(), 1);
}

#[tokio::test]
async fn test_insufficient_authority_never_reaches_breaker_or_target() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    let response = dispatcher.handle(get("/api/admin/users", Some("user-token"))).await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.json_body().unwrap()["status"], 403);
    assert_eq!(forwarder.calls(), 0);
    assert!(dispatcher.breakers().is_empty());
}

#[tokio::test]
async fn test_admin_is_admitted_to_admin_paths() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    let response = dispatcher.handle(get("/api/admin/users", Some("admin-token"))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(forwarder.calls(), 1);
}

#[tokio::test]
async fn test_missing_or_invalid_token_is_unauthenticated() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    let missing = dispatcher.handle(get("/api/parcel/1", None)).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

    let forged = dispatcher.handle(get("/api/parcel/1", Some("forged"))).await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);
    assert_eq!(forged.json_body().unwrap()["error"], "Unauthorized");

    assert_eq!(forwarder.calls(), 0);
}

#[tokio::test]
async fn test_without_verifier_protected_paths_are_unauthenticated() {
    let dispatcher = GatewayDispatcher::new(
        policies(),
        routes(),
        Arc::new(CircuitBreakerRegistry::default()),
        StubForwarder::ok(),
    );
    let response = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_authenticated_only_rule_accepts_principal_without_roles() {
    let dispatcher = dispatcher(StubForwarder::ok());

    // `/api/orders` falls under the authenticated-only `/api` rule but has no route
    let response = dispatcher.handle(get("/api/orders/9", Some("no-roles-token"))).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    let parcel = dispatcher.handle(get("/api/parcel/9", Some("no-roles-token"))).await;
    assert_eq!(parcel.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_deny_rule_is_method_qualified() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    let delete = dispatcher
        .handle(request(Method::DELETE, "/api/archive/1", Some("admin-token")))
        .await;
    assert_eq!(delete.status, StatusCode::FORBIDDEN);

    let read = dispatcher.handle(get("/api/archive/1", Some("user-token"))).await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(forwarder.calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_after_failure_rate_and_returns_fallback() {
    let forwarder = StubForwarder::new(vec![
        Reply::Status(500),
        Reply::Status(502),
        Reply::Error,
        Reply::Status(200),
        Reply::Status(200),
    ]);
    let dispatcher = dispatcher(forwarder.clone());

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await.status);
    }
    // Upstream 5xx is relayed as-is; transport errors become the fallback
    assert_eq!(
        statuses,
        vec![
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::OK,
            StatusCode::OK,
        ]
    );
    assert_eq!(dispatcher.breakers().breaker("parcel-service").phase(), CircuitPhase::Open);

    let rejected = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        rejected.json_body().unwrap(),
        json!({"error": FALLBACK_ERROR, "message": FALLBACK_MESSAGE, "status": 503})
    );
    assert_eq!(forwarder.calls(), 5);

    let snapshot = &dispatcher.breakers().snapshots()[0];
    assert_eq!(snapshot.rejected_calls, 1);
    assert_eq!(snapshot.times_opened, 1);
}

#[tokio::test]
async fn test_breakers_are_per_route() {
    let forwarder = StubForwarder::new(vec![Reply::Error]);
    let config = CircuitBreakerConfig {
        minimum_calls: 1,
        ..CircuitBreakerConfig::default()
    };
    let dispatcher = dispatcher_with(forwarder.clone(), config);

    dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(dispatcher.breakers().breaker("parcel-service").phase(), CircuitPhase::Open);
    assert_eq!(dispatcher.breakers().breaker("admin-service").phase(), CircuitPhase::Closed);

    dispatcher.handle(get("/api/admin/x", Some("admin-token"))).await;
    assert_eq!(forwarder.calls(), 2);
}

#[tokio::test]
async fn test_half_open_recovery_through_dispatcher() {
    let forwarder = StubForwarder::new(vec![Reply::Error, Reply::Status(200)]);
    let config = CircuitBreakerConfig {
        minimum_calls: 1,
        open_duration: Duration::from_millis(50),
        half_open_permits: 2,
        ..CircuitBreakerConfig::default()
    };
    let dispatcher = dispatcher_with(forwarder.clone(), config);

    let failed = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(failed.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(dispatcher.breakers().breaker("parcel-service").phase(), CircuitPhase::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;

    for _ in 0..2 {
        let trial = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
        assert_eq!(trial.status, StatusCode::OK);
    }
    assert_eq!(dispatcher.breakers().breaker("parcel-service").phase(), CircuitPhase::Closed);
    assert_eq!(forwarder.calls(), 3);
}

#[tokio::test]
async fn test_slow_upstream_times_out_as_failure() {
    let forwarder = StubForwarder::new(vec![Reply::Hang]);
    let config = CircuitBreakerConfig {
        call_timeout: Duration::from_millis(50),
        minimum_calls: 1,
        ..CircuitBreakerConfig::default()
    };
    let dispatcher = dispatcher_with(forwarder.clone(), config);

    let response = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json_body().unwrap()["error"], FALLBACK_ERROR);
    let snapshot = dispatcher.breakers().breaker("parcel-service").snapshot();
    assert_eq!(snapshot.failed_calls, 1);
    assert_eq!(snapshot.phase, CircuitPhase::Open);
}

#[tokio::test]
async fn test_rate_limit_rejects_with_headers() {
    let limiter = TokenBucketRateLimiter::new(&RateLimitingConfig {
        replenish_rate: 1,
        burst_capacity: 2,
        requested_tokens: 1,
    })
    .unwrap();
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone()).with_rate_limiter(Arc::new(limiter));

    let first = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(first.headers["x-ratelimit-remaining"], "1");
    let second = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(second.headers["x-ratelimit-remaining"], "0");

    let limited = dispatcher.handle(get("/api/parcel/1", Some("user-token"))).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers["x-ratelimit-remaining"], "0");
    assert_eq!(limited.headers["retry-after"], "1");
    assert_eq!(forwarder.calls(), 2);

    // A different credential has its own bucket
    let admin = dispatcher.handle(get("/api/parcel/1", Some("admin-token"))).await;
    assert_eq!(admin.status, StatusCode::OK);
}

#[tokio::test]
async fn test_authorized_request_without_route_is_not_found() {
    let dispatcher = dispatcher(StubForwarder::ok());
    let response = dispatcher.handle(get("/api/unknown", Some("user-token"))).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json_body().unwrap()["error"], "Not Found");
}

#[tokio::test]
async fn test_non_normalized_paths_are_rejected_before_policy() {
    let forwarder = StubForwarder::ok();
    let dispatcher = dispatcher(forwarder.clone());

    for path in [
        "/api/parcel/../admin/users",
        "/api/public/%2e%2e/admin/users",
        "/api/public/.%2E/admin/users",
        "/api/public/./status",
        "/api//admin/users",
        "/api/public/..%2Fadmin/users",
    ] {
        let response = dispatcher.handle(get(path, Some("user-token"))).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{}", path);
        assert_eq!(response.json_body().unwrap()["error"], "Bad Request");
    }
    assert_eq!(forwarder.calls(), 0);
    assert!(dispatcher.breakers().is_empty());
}

#[tokio::test]
async fn test_dot_segments_cannot_reach_a_stricter_rule() {
    let config = GatewayConfig::from_yaml_str(include_str!("../config/tracking-service.yaml"))
        .unwrap();
    let forwarder = StubForwarder::ok();
    let dispatcher = GatewayDispatcher::new(
        PolicyTable::from_config(&config.policies).unwrap(),
        RouteTable::from_definitions(&config.routes).unwrap(),
        Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            HashMap::new(),
        )),
        forwarder.clone(),
    )
    .with_verifier(verifier());

    let direct = dispatcher
        .handle(request(Method::POST, "/api/tracking/update", Some("user-token")))
        .await;
    assert_eq!(direct.status, StatusCode::FORBIDDEN);

    let dotted = dispatcher
        .handle(request(Method::POST, "/api/tracking/x/../update", Some("user-token")))
        .await;
    assert_eq!(dotted.status, StatusCode::BAD_REQUEST);
    assert_eq!(forwarder.calls(), 0);

    let history = dispatcher
        .handle(get("/api/tracking/p-1/history", Some("user-token")))
        .await;
    assert_eq!(history.status, StatusCode::OK);
    assert_eq!(forwarder.calls(), 1);
}
