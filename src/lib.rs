//! # Sparrow Gateway Library
//!
//! An authorization and resilience gateway for a set of downstream logistics
//! services. Requests are matched against a path policy table, authenticated
//! from a bearer token's verified claims, rate limited, and forwarded through
//! a per-route circuit breaker.
//!
//! The same engine also runs as a service-local "mini-gateway" by loading a
//! different policy table.

/// Error types, configuration, request/response types and the circuit breaker
pub mod core;

/// Claim-to-authority extraction, policy table and token verification
pub mod auth;

/// Rate limiting and CORS
pub mod middleware;

/// Route table, upstream forwarding, dispatcher and HTTP server
pub mod gateway;

/// Structured logging and metrics
pub mod observability;

pub use core::error::{GatewayError, GatewayResult};

pub use core::config::GatewayConfig;

pub use core::types::{GatewayRequest, GatewayResponse, Principal};

pub use gateway::dispatcher::GatewayDispatcher;
