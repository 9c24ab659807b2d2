//! Time bucketing for the sliding-window counter.
//!
//! A bucket slot is the start of a fixed-width interval, expressed in epoch
//! milliseconds and stored as the decimal string of that value.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// A stored bucket: the start of its slot and the weight counted in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Slot start in epoch milliseconds.
    pub slot: i64,
    /// Sum of weights added during the slot.
    pub count: i64,
}

impl Bucket {
    /// Parse a bucket from a stored field name and value.
    ///
    /// Returns `None` when the field is not an integer slot.
    pub fn from_field(field: &str, count: i64) -> Option<Self> {
        field.parse().ok().map(|slot| Self { slot, count })
    }

    /// Whether this bucket still counts toward a window starting at `threshold_ms`.
    pub fn is_live(&self, threshold_ms: i64) -> bool {
        self.slot >= threshold_ms
    }
}

/// Milliseconds in `duration`, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// The slot `now` falls into for buckets `width` wide.
///
/// Slots are aligned to the Unix epoch, so every limiter with the same width
/// agrees on bucket boundaries.
pub fn slot_for(now: DateTime<Utc>, width: Duration) -> i64 {
    let width = duration_millis(width).max(1);
    now.timestamp_millis().div_euclid(width) * width
}

/// Field name under which the bucket for `slot` is stored.
pub fn field_name(slot: i64) -> String {
    slot.to_string()
}

/// Start of the trailing window of length `period` ending at `now`.
pub fn window_threshold(now: DateTime<Utc>, period: Duration) -> i64 {
    now.timestamp_millis().saturating_sub(duration_millis(period))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_slot_truncates_to_width() {
        let width = Duration::from_secs(1);
        assert_eq!(slot_for(at_millis(0), width), 0);
        assert_eq!(slot_for(at_millis(999), width), 0);
        assert_eq!(slot_for(at_millis(1_000), width), 1_000);
        assert_eq!(slot_for(at_millis(61_234), Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn test_slot_sub_second_width() {
        assert_eq!(slot_for(at_millis(1_260), Duration::from_millis(250)), 1_250);
    }

    #[test]
    fn test_slot_before_epoch() {
        assert_eq!(slot_for(at_millis(-1), Duration::from_secs(1)), -1_000);
    }

    #[test]
    fn test_threshold() {
        assert_eq!(window_threshold(at_millis(10_000), Duration::from_secs(5)), 5_000);
    }

    #[test]
    fn test_bucket_liveness_is_numeric() {
        // "999" sorts after "10000" as a string but is older as a number.
        let old = Bucket::from_field("999", 1).unwrap();
        let fresh = Bucket::from_field("10000", 1).unwrap();

        assert!(!old.is_live(1_000));
        assert!(fresh.is_live(1_000));
        assert!(Bucket::from_field("1000", 1).unwrap().is_live(1_000));
    }

    #[test]
    fn test_bucket_from_bad_field() {
        assert_eq!(Bucket::from_field("not-a-slot", 3), None);
        assert_eq!(field_name(42), "42");
    }
}
