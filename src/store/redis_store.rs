//! Redis-backed counter store.
//!
//! Each rate limit key maps to one Redis hash whose fields are bucket slots.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::info;

use super::{CounterStore, StoreError};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout(e.to_string())
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Counter store backed by a shared Redis connection.
///
/// The connection manager multiplexes every caller over one connection and
/// reconnects on failure, so a single `RedisStore` can be cloned freely.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (for example `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.hincr(key, field, by).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let _: i64 = conn.pexpire(key, millis).await?;
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, i64> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, fields).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_timeout_maps_to_timeout() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(matches!(StoreError::from(err), StoreError::Timeout(_)));
    }

    #[test]
    fn test_refused_connection_maps_to_unavailable() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(StoreError::from(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn test_io_failure_maps_to_unavailable() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(matches!(StoreError::from(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn test_reply_error_maps_to_protocol() {
        let err = RedisError::from((redis::ErrorKind::TypeError, "not an integer"));
        match StoreError::from(err) {
            StoreError::Protocol(msg) => assert!(msg.contains("not an integer")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let err = RedisStore::connect("not a redis url").await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
