//! Sliding Window Counters - approximate sliding-window rate limiting
//!
//! This crate decides whether a caller identified by a key may spend a given
//! weight under a quota of N events per period. Counts are kept in fixed-width
//! time buckets inside a shared, TTL-capable counter store, so memory per key
//! is bounded no matter how much traffic the key sends.
//!
//! - [`ratelimit`] holds the [`Limiter`](ratelimit::Limiter) contract and the
//!   bucketed [`SlidingWindowLimiter`](ratelimit::SlidingWindowLimiter).
//! - [`store`] holds the [`CounterStore`](store::CounterStore) protocol with
//!   in-memory and Redis implementations.
//! - [`middleware`] adapts a limiter to HTTP as a tower layer.

pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
