//! Bucketed sliding-window rate limiter.
//!
//! Time is cut into fixed-width buckets (the counter window). Every key owns
//! one store record whose fields are bucket slots and whose values are the
//! weights charged during that slot. An increment bumps the current bucket,
//! then sums every bucket that starts inside the trailing period. Buckets that
//! fall out of the period are deleted as soon as they are seen, so a record
//! never holds more than `period / counter_window` live fields.
//!
//! The count is approximate by at most one bucket: a bucket straddling the
//! trailing edge of the window is counted entirely or not at all.
//!
//! Only the single-field increment is atomic. The increment, expiry refresh,
//! read and prune steps are separate round trips, so concurrent callers on the
//! same key can each miss the other's increment and admit slightly more than
//! `limit` events. This is accepted in exchange for needing no per-key lock.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace, warn};

use super::bucket::{self, Bucket};
use super::limiter::Limiter;
use super::status::{LimitStatus, RateLimitError};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::store::CounterStore;

/// Quota and bucketing parameters for a [`SlidingWindowLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Maximum weighted events per period.
    pub limit: u64,
    /// Length of the sliding window.
    pub period: Duration,
    /// Width of one bucket.
    pub counter_window: Duration,
    /// Namespace prepended to every key as `"{prefix}:{key}"`.
    ///
    /// Limiters with different settings that share a store must use distinct
    /// prefixes (or otherwise disjoint keys).
    pub key_prefix: Option<String>,
}

impl LimiterSettings {
    /// Create settings without a key prefix.
    pub fn new(limit: u64, period: Duration, counter_window: Duration) -> Self {
        Self {
            limit,
            period,
            counter_window,
            key_prefix: None,
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Check the settings describe a usable window.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::Config("limit must be positive".into()));
        }
        if i64::try_from(self.limit).is_err() {
            return Err(Error::Config(format!("limit {} is too large", self.limit)));
        }
        if self.period.is_zero() {
            return Err(Error::Config("period must be positive".into()));
        }
        if chrono::Duration::from_std(self.period).is_err() {
            return Err(Error::Config(format!("period {:?} is too long", self.period)));
        }
        if self.counter_window.is_zero() {
            return Err(Error::Config("counter window must be positive".into()));
        }
        if self.counter_window > self.period {
            return Err(Error::Config(format!(
                "counter window {:?} is longer than period {:?}",
                self.counter_window, self.period
            )));
        }
        if self.period.as_millis() % self.counter_window.as_millis().max(1) != 0 {
            warn!(
                period = ?self.period,
                counter_window = ?self.counter_window,
                "Period is not a whole number of counter windows; bucket counts per window will vary"
            );
        }
        Ok(())
    }
}

/// Sliding-window limiter over a shared [`CounterStore`].
pub struct SlidingWindowLimiter<S> {
    store: S,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for SlidingWindowLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S: CounterStore> SlidingWindowLimiter<S> {
    /// Create a limiter over `store`. Fails if `settings` are invalid.
    pub fn new(store: S, settings: LimiterSettings) -> Result<Self> {
        settings.validate()?;
        debug!(
            limit = settings.limit,
            period = ?settings.period,
            counter_window = ?settings.counter_window,
            key_prefix = ?settings.key_prefix,
            "Creating sliding window limiter"
        );
        Ok(Self {
            store,
            settings,
            clock: Arc::new(SystemClock),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The limiter's settings.
    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Name of the store record holding `key`'s buckets.
    pub fn record_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match &self.settings.key_prefix {
            Some(prefix) => Cow::Owned(format!("{prefix}:{key}")),
            None => Cow::Borrowed(key),
        }
    }

    fn exceeded(&self, reset: DateTime<Utc>) -> RateLimitError {
        RateLimitError::Exceeded(LimitStatus::exceeded(
            self.settings.limit,
            self.settings.period,
            reset,
        ))
    }

    #[instrument(
        skip(self),
        fields(limit = self.settings.limit, period = ?self.settings.period)
    )]
    async fn charge(&self, key: &str, weight: u64) -> std::result::Result<LimitStatus, RateLimitError> {
        if key.is_empty() {
            return Err(RateLimitError::EmptyKey);
        }
        let by = match i64::try_from(weight) {
            Ok(by) if by > 0 => by,
            _ => return Err(RateLimitError::InvalidWeight(weight)),
        };

        let limit = self.settings.limit;
        let period = self.settings.period;
        let now = self.clock.now();
        let reset = chrono::Duration::from_std(period)
            .ok()
            .and_then(|p| now.checked_add_signed(p))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let record = self.record_key(key);
        let slot = bucket::slot_for(now, self.settings.counter_window);
        let field = bucket::field_name(slot);

        let bucket_count = self.store.increment_field(&record, &field, by).await?;
        self.store.expire(&record, period).await?;

        trace!(record = %record, slot, bucket_count, "Incremented bucket");

        // A burst concentrated in one bucket is rejected without summing.
        if units(bucket_count) >= limit {
            debug!(record = %record, slot, bucket_count, "Rate limit exceeded within a single bucket");
            return Err(self.exceeded(reset));
        }

        let fields = self.store.get_all(&record).await?;
        let threshold = bucket::window_threshold(now, period);

        let mut total: u64 = 0;
        let mut stale = Vec::new();
        for (field, count) in fields {
            match Bucket::from_field(&field, count) {
                Some(b) if b.is_live(threshold) => total = total.saturating_add(units(b.count)),
                _ => stale.push(field),
            }
        }

        if !stale.is_empty() {
            debug!(record = %record, pruned = stale.len(), threshold, "Pruning stale buckets");
            self.store.delete_fields(&record, &stale).await?;
        }

        if total >= limit {
            debug!(record = %record, total, "Rate limit exceeded");
            return Err(self.exceeded(reset));
        }

        trace!(record = %record, total, remaining = limit - total, "Admitted");
        Ok(LimitStatus {
            remaining: limit - total,
            limit,
            period,
            reset,
        })
    }
}

fn units(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl<S: CounterStore> Limiter for SlidingWindowLimiter<S> {
    async fn increment(&self, key: &str, weight: u64) -> std::result::Result<LimitStatus, RateLimitError> {
        self.charge(key, weight).await
    }
}
