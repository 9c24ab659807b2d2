//! Process-local counter store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Default)]
struct Record {
    fields: HashMap<String, i64>,
    expires_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory counter store with per-record expiry.
///
/// Records behave like Redis hashes: they are created on first increment,
/// vanish when their last field is deleted, and are dropped once their TTL
/// passes. Expired records are removed lazily on access, or eagerly with
/// [`MemoryStore::purge_expired`].
///
/// Clones share the same records.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: Arc<DashMap<String, Record>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Drop every record whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            trace!(removed, "Purged expired counter records");
        }
        removed
    }

    /// Remaining time to live of a record, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let record = self.records.get(key)?;
        let expires_at = record.expires_at?;
        (expires_at - now).to_std().ok()
    }

    /// Whether a live record exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.records
            .get(key)
            .is_some_and(|record| !record.is_expired(now))
    }

    /// Number of records currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut record = self.records.entry(key.to_string()).or_default();
        if record.is_expired(now) {
            *record = Record::default();
        }

        let count = record.fields.entry(field.to_string()).or_insert(0);
        let next = count
            .checked_add(by)
            .ok_or_else(|| StoreError::Protocol(format!("increment of field {field} overflows")))?;
        *count = next;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Protocol(format!("invalid ttl: {e}")))?;

        if let Some(mut record) = self.records.get_mut(key) {
            if !record.is_expired(now) {
                record.expires_at = now.checked_add_signed(ttl);
            }
        }
        Ok(())
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let now = self.clock.now();
        if self
            .records
            .remove_if(key, |_, record| record.is_expired(now))
            .is_some()
        {
            return Ok(HashMap::new());
        }

        Ok(self
            .records
            .get(key)
            .map(|record| record.fields.clone())
            .unwrap_or_default())
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        let emptied = match self.records.get_mut(key) {
            Some(mut record) => {
                for field in fields {
                    record.fields.remove(field);
                }
                record.fields.is_empty()
            }
            None => false,
        };

        if emptied {
            self.records.remove_if(key, |_, record| record.fields.is_empty());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_creates_record() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.increment_field("user1", "1000", 2).await.unwrap(), 2);
        assert_eq!(store.increment_field("user1", "1000", 3).await.unwrap(), 5);
        assert_eq!(store.increment_field("user1", "2000", 1).await.unwrap(), 1);

        let fields = store.get_all("user1").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["1000"], 5);
        assert_eq!(fields["2000"], 1);
    }

    #[tokio::test]
    async fn test_missing_record_reads_empty() {
        let (store, _clock) = store_with_clock();
        assert!(store.get_all("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_drops_record() {
        let (store, clock) = store_with_clock();

        store.increment_field("user1", "0", 1).await.unwrap();
        store.expire("user1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.ttl("user1"), Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(4));
        assert!(store.contains("user1"));

        clock.advance(Duration::from_secs(1));
        assert!(!store.contains("user1"));
        assert!(store.get_all("user1").await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_after_expiry_starts_fresh() {
        let (store, clock) = store_with_clock();

        store.increment_field("user1", "0", 7).await.unwrap();
        store.expire("user1", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.increment_field("user1", "0", 1).await.unwrap(), 1);
        assert_eq!(store.ttl("user1"), None);
    }

    #[tokio::test]
    async fn test_expire_missing_record_is_noop() {
        let (store, _clock) = store_with_clock();
        store.expire("ghost", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_fields() {
        let (store, _clock) = store_with_clock();

        store.increment_field("user1", "1", 1).await.unwrap();
        store.increment_field("user1", "2", 1).await.unwrap();
        store.increment_field("user1", "3", 1).await.unwrap();

        store
            .delete_fields("user1", &["1".to_string(), "2".to_string()])
            .await
            .unwrap();

        let fields = store.get_all("user1").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert!(fields.contains_key("3"));
    }

    #[tokio::test]
    async fn test_deleting_last_field_removes_record() {
        let (store, _clock) = store_with_clock();

        store.increment_field("user1", "1", 1).await.unwrap();
        store.delete_fields("user1", &["1".to_string()]).await.unwrap();

        assert!(!store.contains("user1"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.increment_field("short", "0", 1).await.unwrap();
        store.expire("short", Duration::from_secs(1)).await.unwrap();
        store.increment_field("long", "0", 1).await.unwrap();
        store.expire("long", Duration::from_secs(60)).await.unwrap();
        store.increment_field("forever", "0", 1).await.unwrap();

        clock.advance(Duration::from_secs(2));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.contains("long"));
        assert!(store.contains("forever"));
    }

    #[tokio::test]
    async fn test_overflow_is_protocol_error() {
        let (store, _clock) = store_with_clock();

        store.increment_field("user1", "0", i64::MAX).await.unwrap();
        let err = store.increment_field("user1", "0", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let (store, _clock) = store_with_clock();
        let other = store.clone();

        store.increment_field("user1", "0", 4).await.unwrap();
        assert_eq!(other.get_all("user1").await.unwrap()["0"], 4);
    }
}
