pub mod cors;
pub mod path_guard;
pub mod rate_limiting;

pub use cors::cors_layer;
pub use path_guard::{check_path, PathRejection};
pub use rate_limiting::{
    RateLimitError, RateLimitKeyResolver, RateLimitResult, RateLimiter, TokenBucketRateLimiter,
};
