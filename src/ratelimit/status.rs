//! Limit status and the error outcomes of an increment.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// The quota state of a key after an increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitStatus {
    /// Quota units left in the trailing window.
    pub remaining: u64,
    /// Configured maximum per period.
    pub limit: u64,
    /// Configured window length.
    pub period: Duration,
    /// When the window would be clear if no further events arrive.
    ///
    /// The window slides continuously, so this is informational rather than a
    /// hard boundary.
    pub reset: DateTime<Utc>,
}

impl LimitStatus {
    /// Status reported when the quota is exhausted.
    pub fn exceeded(limit: u64, period: Duration, reset: DateTime<Utc>) -> Self {
        Self {
            remaining: 0,
            limit,
            period,
            reset,
        }
    }

    /// Time from `now` until `reset`, zero if already past.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Why an increment was not admitted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The key has used up its quota. Carries the status with `remaining = 0`.
    #[error(
        "rate limit of {} per {:?} has been exceeded and resets at {}",
        .0.limit, .0.period, .0.reset
    )]
    Exceeded(LimitStatus),

    /// The counter store failed. The bucket increment may already have landed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Keys must be non-empty.
    #[error("rate limit key must not be empty")]
    EmptyKey,

    /// Weights must be positive.
    #[error("rate limit weight must be positive, got {0}")]
    InvalidWeight(u64),
}

impl RateLimitError {
    /// Whether this is the quota-exhausted outcome.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, RateLimitError::Exceeded(_))
    }

    /// The limit status carried by an exceeded outcome.
    pub fn status(&self) -> Option<&LimitStatus> {
        match self {
            RateLimitError::Exceeded(status) => Some(status),
            _ => None,
        }
    }
}
