//! Tower middleware that applies a [`Limiter`](crate::ratelimit::Limiter) to HTTP requests.
//!
//! The middleware only translates between HTTP and the limiter:
//! - a [`KeyExtractor`] turns the request into a rate limit key,
//! - the limiter decides,
//! - the outcome becomes `X-RateLimit-*` headers, a `429`, or a `500`.

mod key;
mod layer;

pub use key::{IpKeyExtractor, KeyError, KeyExtractor};
pub use layer::{
    http_date, RateLimitLayer, RateLimitService, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
