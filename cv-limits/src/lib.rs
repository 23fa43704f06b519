//! Admission and flood control for Convoy.
//!
//! [`UpdateProcessor`] bounds how many inbound updates run at once;
//! [`RateLimiter`] keeps outbound calls within the remote service's limits.

mod bucket;
mod error;
mod lifecycle;
mod limiter;
mod processor;
mod scope;

pub use bucket::LeakyBucket;
pub use error::{LimitError, Result};
pub use lifecycle::{Lifecycle, LifecycleStack, scoped};
pub use limiter::{
    MAX_GROUP_BUCKETS, RETRY_AFTER_MARGIN, RateLimitConfig, RateLimiter, ThrottleSignal,
};
pub use processor::{ProcessorHooks, SimpleUpdates, UpdateProcessor};
pub use scope::RequestScope;
