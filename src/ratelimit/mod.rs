//! Rate limiting logic.

mod bucket;
mod limiter;
mod status;
mod window;

pub use bucket::Bucket;
pub use limiter::Limiter;
pub use status::{LimitStatus, RateLimitError};
pub use window::{LimiterSettings, SlidingWindowLimiter};
