//! Shared counter storage used by the sliding-window limiter.
//!
//! A store holds one composite record per rate limit key. Each record is a
//! map of bucket slot to count with a record-wide expiry, the same shape as a
//! Redis hash with a TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Errors raised by a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("counter store timed out: {0}")]
    Timeout(String),

    /// The store answered with something we could not interpret.
    #[error("counter store protocol error: {0}")]
    Protocol(String),
}

/// The four primitives the limiter needs from a key/value store.
///
/// Implementations must make `increment_field` atomic with respect to other
/// callers. Nothing else is required to be atomic.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to `field` within the record at `key`, creating the record and
    /// the field as needed. Returns the field's new value.
    async fn increment_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// Set (or refresh) the expiry of the record at `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read every field of the record at `key`. A missing record is empty.
    async fn get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError>;

    /// Remove the given fields from the record at `key`.
    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for std::sync::Arc<S> {
    async fn increment_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        (**self).increment_field(key, field, by).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).expire(key, ttl).await
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        (**self).get_all(key).await
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        (**self).delete_fields(key, fields).await
    }
}
