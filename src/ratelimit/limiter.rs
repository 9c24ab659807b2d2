//! Limiter trait for abstracting over rate limit backends.

use std::sync::Arc;

use async_trait::async_trait;

use super::status::{LimitStatus, RateLimitError};

/// Trait for rate limiter implementations.
///
/// `increment` charges `weight` units to `key` and reports the resulting
/// quota. A denied call returns [`RateLimitError::Exceeded`]; a failure of the
/// underlying store returns [`RateLimitError::Store`], so callers can tell
/// "quota exhausted" apart from "store unreachable" and pick their own
/// fail-open or fail-closed policy.
///
/// Dropping the returned future cancels the call before any further store
/// round trip. Work already applied to the store is not undone.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Charge `weight` units to `key`.
    async fn increment(&self, key: &str, weight: u64) -> Result<LimitStatus, RateLimitError>;
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    async fn increment(&self, key: &str, weight: u64) -> Result<LimitStatus, RateLimitError> {
        (**self).increment(key, weight).await
    }
}
