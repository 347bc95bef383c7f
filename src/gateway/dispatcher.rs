//! # Gateway Dispatcher
//!
//! Runs one request through the gateway pipeline, each step short-circuiting:
//!
//! 1. path check (400 for paths the upstream URL would rewrite)
//! 2. policy lookup (`deny` answers 403, `public` skips authentication)
//! 3. bearer token verification into a claim set (401 on absence or failure)
//! 4. principal construction and authority check (403)
//! 5. rate limiting on the resolved key (429)
//! 6. route lookup (404)
//! 7. circuit breaker admission (fallback 503 when rejected)
//! 8. forwarding under the route's call timeout, recording the outcome
//!
//! Every failure becomes a response; nothing escapes `handle`.

use axum::http::HeaderValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::auth::claims::principal_from_claims;
use crate::auth::policy::{PolicyDecision, PolicyTable};
use crate::auth::verifier::{ClaimVerifier, JwtClaimVerifier};
use crate::core::circuit_breaker::{CallOutcome, CircuitBreakerRegistry};
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, GatewayResponse, Principal};
use crate::gateway::forwarder::{Forwarder, HttpForwarder};
use crate::gateway::routes::RouteTable;
use crate::middleware::path_guard::check_path;
use crate::middleware::rate_limiting::{RateLimitKeyResolver, RateLimiter, TokenBucketRateLimiter};
use crate::observability::metrics;

/// Metrics label for requests that never reached a route
const UNROUTED: &str = "none";

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GatewayDispatcher {
    policies: Arc<PolicyTable>,
    routes: Arc<RouteTable>,
    breakers: Arc<CircuitBreakerRegistry>,
    forwarder: Arc<dyn Forwarder>,
    verifier: Option<Arc<dyn ClaimVerifier>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    key_resolver: RateLimitKeyResolver,
}

impl GatewayDispatcher {
    pub fn new(
        policies: PolicyTable,
        routes: RouteTable,
        breakers: Arc<CircuitBreakerRegistry>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            routes: Arc::new(routes),
            breakers,
            forwarder,
            verifier: None,
            rate_limiter: None,
            key_resolver: RateLimitKeyResolver,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ClaimVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Wire the production collaborators from configuration
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let policies = PolicyTable::from_config(&config.policies)?;
        let routes = RouteTable::from_definitions(&config.routes)?;

        let overrides: HashMap<_, _> = config
            .routes
            .iter()
            .filter_map(|route| {
                route
                    .circuit_breaker
                    .clone()
                    .map(|breaker| (route.id.clone(), breaker))
            })
            .collect();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            overrides,
        ));

        let forwarder = Arc::new(HttpForwarder::new(UPSTREAM_CONNECT_TIMEOUT)?);
        let mut dispatcher = Self::new(policies, routes, breakers, forwarder);

        match &config.auth.jwt {
            Some(jwt) => {
                dispatcher = dispatcher.with_verifier(Arc::new(JwtClaimVerifier::from_config(jwt)?));
            }
            None => warn!("No token verifier configured; protected paths will answer 401"),
        }

        if let Some(limits) = &config.rate_limiting {
            let limiter = TokenBucketRateLimiter::start(limits)
                .map_err(|e| GatewayError::config(e.to_string()))?;
            dispatcher = dispatcher.with_rate_limiter(limiter);
        }

        Ok(dispatcher)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Handle one request. Never fails; errors are rendered as responses.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(request_id = %request.id, method = %request.method, path = %request.path())
    )]
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let route_label = self
            .routes
            .match_route(request.path())
            .map(|route| route.id.clone())
            .unwrap_or_else(|| UNROUTED.to_string());

        let response = match self.dispatch(&request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, status = err.status_code().as_u16(), "Request short-circuited");
                err.to_response()
            }
        };

        metrics::record_request(&route_label, response.status.as_u16());
        response
    }

    /// Apply the policy table to a request. Public paths yield no principal.
    pub async fn authorize(&self, request: &GatewayRequest) -> GatewayResult<Option<Principal>> {
        check_path(request.path()).map_err(|rejection| {
            warn!(path = %request.path(), reason = %rejection, "Request path rejected");
            GatewayError::bad_request(rejection.to_string())
        })?;

        let decision = self.policies.decide(request.path(), &request.method);
        debug!(?decision, "Policy decision");

        match &decision {
            PolicyDecision::Deny => {
                warn!(path = %request.path(), "Request denied by policy");
                Err(GatewayError::unauthorized("Access to this path is denied"))
            }
            PolicyDecision::Public => Ok(None),
            PolicyDecision::RequiresAnyOf(_) => {
                let principal = self.authenticate(request).await?;
                if !decision.permits(&principal) {
                    warn!(
                        user = %principal.username,
                        path = %request.path(),
                        "Principal lacks a required authority"
                    );
                    return Err(GatewayError::unauthorized(
                        "Insufficient authorities for this resource",
                    ));
                }
                debug!(user = %principal.username, "Request authorized");
                Ok(Some(principal))
            }
        }
    }

    async fn dispatch(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        self.authorize(request).await?;

        let remaining = self.check_rate_limit(request).await?;

        let mut response = self.forward(request).await?;
        if let Some(remaining) = remaining {
            response
                .headers
                .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
        }
        Ok(response)
    }

    async fn authenticate(&self, request: &GatewayRequest) -> GatewayResult<Principal> {
        let token = request
            .bearer_token()
            .ok_or_else(|| GatewayError::unauthenticated("Missing bearer token"))?;

        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| GatewayError::unauthenticated("Token verification is not configured"))?;

        let claims = verifier.verify(token).await.map_err(|e| {
            warn!(error = %e, "Token verification failed");
            GatewayError::unauthenticated(e.to_string())
        })?;

        Ok(principal_from_claims(&claims))
    }

    /// Returns the tokens left for the caller, when a limiter is configured
    async fn check_rate_limit(&self, request: &GatewayRequest) -> GatewayResult<Option<u32>> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(None);
        };

        let key = self.key_resolver.resolve_key(request);
        match limiter.check(&key).await {
            Ok(result) if result.allowed => Ok(Some(result.remaining)),
            Ok(result) => {
                metrics::record_rate_limited();
                debug!(path = %request.path(), "Rate limit exceeded");
                Err(GatewayError::RateLimited {
                    retry_after: result.retry_after,
                })
            }
            Err(e) => {
                // Fail open on limiter errors
                warn!(error = %e, "Rate limiter unavailable, admitting request");
                Ok(None)
            }
        }
    }

    async fn forward(&self, request: &GatewayRequest) -> GatewayResult<GatewayResponse> {
        let route = self
            .routes
            .match_route(request.path())
            .ok_or_else(|| GatewayError::RouteNotFound {
                path: request.path().to_string(),
            })?;

        let breaker = self.breakers.breaker(&route.id);
        let permit = breaker.try_acquire().map_err(|e| {
            debug!(route = %route.id, reason = %e, "Circuit breaker rejected call");
            GatewayError::CircuitOpen {
                route: route.id.clone(),
            }
        })?;

        let call_timeout = permit.call_timeout();
        let result = tokio::time::timeout(call_timeout, self.forwarder.forward(route, request)).await;
        metrics::record_upstream_latency(&route.id, permit.elapsed());

        match result {
            Ok(Ok(response)) => {
                if response.status.is_server_error() {
                    warn!(route = %route.id, status = response.status.as_u16(), "Upstream answered with a server error");
                    permit.complete(CallOutcome::Failure);
                } else {
                    permit.complete(CallOutcome::Success);
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(route = %route.id, error = %e, "Upstream call failed");
                permit.complete(CallOutcome::Failure);
                Err(GatewayError::upstream(route.id.clone(), e.to_string()))
            }
            Err(_) => {
                warn!(route = %route.id, timeout_ms = call_timeout.as_millis() as u64, "Upstream call timed out");
                permit.complete(CallOutcome::Timeout);
                Err(GatewayError::UpstreamTimeout {
                    route: route.id.clone(),
                    timeout_ms: call_timeout.as_millis() as u64,
                })
            }
        }
    }
}
