//! Rate limiting logic and state management.

mod config;
mod key;
mod limiter;
mod registry;
mod state;

pub use config::{RateLimitConfig, RawRateLimitConfig};
pub use key::StoreKey;
pub use limiter::{
    LimitStatus, RateLimiter, DEFAULT_ACTION, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CEILING,
    DEFAULT_ERROR_COUNTER_TTL,
};
pub use registry::PlatformRegistry;
pub use state::RateLimitState;
