//! # Rate Limiting
//!
//! Two pieces:
//! - `RateLimitKeyResolver` derives the bucket key for a request. It is a pure
//!   function: the literal `Authorization` header value when present, else the
//!   caller's IP address.
//! - `RateLimiter` consumes a bucket for a key. `TokenBucketRateLimiter` is
//!   the in-process implementation, one bucket per key in a `DashMap`, with
//!   a background task that drops buckets once they have refilled.

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::config::RateLimitingConfig;
use crate::core::types::GatewayRequest;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left in the bucket after this request
    pub remaining: u32,
    /// Time until enough tokens are available, set on rejection
    pub retry_after: Option<Duration>,
}

/// Derives the throttling key of a request
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitKeyResolver;

impl RateLimitKeyResolver {
    pub fn resolve_key(&self, request: &GatewayRequest) -> String {
        match request.header(AUTHORIZATION.as_str()) {
            Some(credential) => credential.to_string(),
            None => request.remote_addr.ip().to_string(),
        }
    }
}

/// Consumes request budget for a key
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str) -> Result<RateLimitResult, RateLimitError>;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Lower bound on how often idle buckets are swept
const MIN_EVICTION_INTERVAL: Duration = Duration::from_millis(250);

/// In-memory token bucket limiter
pub struct TokenBucketRateLimiter {
    replenish_rate: f64,
    burst_capacity: f64,
    requested_tokens: f64,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucketRateLimiter {
    pub fn new(config: &RateLimitingConfig) -> Result<Self, RateLimitError> {
        if config.replenish_rate == 0 {
            return Err(RateLimitError::Configuration(
                "replenish_rate must be greater than 0".to_string(),
            ));
        }
        if config.requested_tokens == 0 || config.burst_capacity < config.requested_tokens {
            return Err(RateLimitError::Configuration(
                "burst_capacity must be at least requested_tokens, which must be at least 1"
                    .to_string(),
            ));
        }
        Ok(Self {
            replenish_rate: f64::from(config.replenish_rate),
            burst_capacity: f64::from(config.burst_capacity),
            requested_tokens: f64::from(config.requested_tokens),
            buckets: DashMap::new(),
        })
    }

    /// Build a limiter and start sweeping buckets that have refilled
    /// completely. A full bucket behaves like a missing one, so sweeping never
    /// changes a decision.
    pub fn start(config: &RateLimitingConfig) -> Result<Arc<Self>, RateLimitError> {
        let limiter = Arc::new(Self::new(config)?);
        if tokio::runtime::Handle::try_current().is_ok() {
            let every = limiter.full_refill_time().max(MIN_EVICTION_INTERVAL);
            limiter.spawn_eviction(every);
        } else {
            warn!("No Tokio runtime; idle rate limit buckets will not be evicted");
        }
        Ok(limiter)
    }

    /// Periodically evict buckets idle for a full refill. The task ends once
    /// the limiter is dropped.
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let evicted = limiter.evict_idle(limiter.full_refill_time());
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.tracked_keys(), "Evicted idle rate limit buckets");
                }
            }
        })
    }

    /// Consume tokens for `key` as of `now`
    pub fn try_consume_at(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst_capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.replenish_rate).min(self.burst_capacity);
        bucket.last_refill = now;

        if bucket.tokens >= self.requested_tokens {
            bucket.tokens -= self.requested_tokens;
            RateLimitResult {
                allowed: true,
                remaining: bucket.tokens.floor() as u32,
                retry_after: None,
            }
        } else {
            let missing = self.requested_tokens - bucket.tokens;
            debug!(key = %key, tokens = bucket.tokens, "Token bucket exhausted");
            RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after: Some(Duration::from_secs_f64(missing / self.replenish_rate)),
            }
        }
    }

    /// Drop buckets untouched for at least `max_idle`; returns how many were removed
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
        before - self.buckets.len()
    }

    /// Time for an empty bucket to fill up again
    pub fn full_refill_time(&self) -> Duration {
        Duration::from_secs_f64(self.burst_capacity / self.replenish_rate)
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn check(&self, key: &str) -> Result<RateLimitResult, RateLimitError> {
        Ok(self.try_consume_at(key, Instant::now()))
    }
}
