//! # Configuration Module
//!
//! Gateway configuration loaded once at startup from YAML, with a small set of
//! environment variable overrides applied on top.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable override support
//! - Validation that reports every problem at once
//!
//! Policies and routes are immutable after load; there is no hot reload.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::auth::policy::PolicyRuleConfig;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Config file used when `GATEWAY_CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Service identity and listener
    pub service: ServiceConfig,

    /// Log level and output format
    pub logging: LoggingConfig,

    /// Token verification settings
    pub auth: AuthConfig,

    /// Authorization rules, in declaration order
    pub policies: Vec<PolicyRuleConfig>,

    /// Downstream route definitions
    pub routes: Vec<RouteDefinition>,

    /// Breaker defaults for routes without overrides
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-key request throttling; disabled when absent
    pub rate_limiting: Option<RateLimitingConfig>,

    /// Cross-origin policy at the edge
    pub cors: CorsConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse without overrides or validation
    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(name) = env::var("GATEWAY_SERVICE_NAME") {
            self.service.name = name;
        }

        if let Ok(addr) = env::var("GATEWAY_BIND_ADDRESS") {
            self.service.bind_address = addr;
        }

        if let Ok(port) = env::var("GATEWAY_PORT") {
            self.service.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_PORT: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_LOG_FORMAT: {} (expected json or pretty)",
                        other
                    )))
                }
            };
        }

        if let Ok(timeout) = env::var("GATEWAY_CALL_TIMEOUT") {
            self.circuit_breaker.call_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_CALL_TIMEOUT: {}", e)))?;
        }

        if let Ok(secret) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt.get_or_insert_with(JwtConfig::default).secret = secret;
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.service.name.trim().is_empty() {
            errors.push("service.name cannot be empty".to_string());
        }
        if self.service.bind_address.is_empty() {
            errors.push("service.bind_address cannot be empty".to_string());
        }
        if self.service.port == 0 {
            errors.push("service.port must be greater than 0".to_string());
        }
        if self.service.max_body_size == 0 {
            errors.push("service.max_body_size must be greater than 0".to_string());
        }

        if let Some(jwt) = &self.auth.jwt {
            if jwt.secret.is_empty() {
                errors.push("auth.jwt.secret cannot be empty".to_string());
            }
        }

        for (index, policy) in self.policies.iter().enumerate() {
            if !policy.path.starts_with('/') {
                errors.push(format!("Policy {} path must start with '/': {}", index, policy.path));
            }
        }

        let mut route_ids = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            if route.id.is_empty() {
                errors.push(format!("Route {} has an empty id", index));
            } else if !route_ids.insert(route.id.as_str()) {
                errors.push(format!("Duplicate route id: {}", route.id));
            }
            if !route.path.starts_with('/') {
                errors.push(format!("Route '{}' path must start with '/'", route.id));
            }
            match Url::parse(&route.upstream) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(format!(
                    "Route '{}' upstream has unsupported scheme: {}",
                    route.id,
                    url.scheme()
                )),
                Err(e) => errors.push(format!("Route '{}' has an invalid upstream URL: {}", route.id, e)),
            }
            if let Some(breaker) = &route.circuit_breaker {
                errors.extend(
                    breaker
                        .problems()
                        .into_iter()
                        .map(|p| format!("Route '{}' circuit_breaker: {}", route.id, p)),
                );
            }
        }

        errors.extend(
            self.circuit_breaker
                .problems()
                .into_iter()
                .map(|p| format!("circuit_breaker: {}", p)),
        );

        if let Some(limits) = &self.rate_limiting {
            if limits.replenish_rate == 0 {
                errors.push("rate_limiting.replenish_rate must be greater than 0".to_string());
            }
            if limits.requested_tokens == 0 {
                errors.push("rate_limiting.requested_tokens must be greater than 0".to_string());
            }
            if limits.burst_capacity < limits.requested_tokens {
                errors.push(
                    "rate_limiting.burst_capacity must be at least requested_tokens".to_string(),
                );
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Socket address string for the listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.service.bind_address, self.service.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Reported by the health and info endpoints
    pub name: String,
    pub bind_address: String,
    pub port: u16,
    /// Largest request body buffered for forwarding, in bytes
    pub max_body_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "api-gateway".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `sparrow_gateway=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static-key JWT verification; without it every protected path answers 401
    pub jwt: Option<JwtConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC secret, or a PEM public key for RSA/EC/Ed25519 algorithms
    pub secret: String,
    pub algorithm: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp` and `nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: "HS256".to_string(),
            issuer: None,
            audience: None,
            leeway: Duration::from_secs(30),
        }
    }
}

/// A downstream route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Also the circuit breaker's route id
    pub id: String,
    /// Path prefix, `/**` suffix allowed
    pub path: String,
    /// Base URL of the target service
    pub upstream: String,
    /// Leading path segments removed before forwarding
    #[serde(default)]
    pub strip_prefix: usize,
    /// Breaker settings replacing the defaults for this route
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Tokens added to each bucket per second
    pub replenish_rate: u32,
    /// Bucket size
    pub burst_capacity: u32,
    /// Tokens taken by one request
    pub requested_tokens: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            replenish_rate: 10,
            burst_capacity: 20,
            requested_tokens: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Explicit origins; empty means any origin
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    /// Explicit headers; empty means any header
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: Vec::new(),
            allow_credentials: true,
            max_age: Duration::from_secs(3600),
        }
    }
}
