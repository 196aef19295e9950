//! Outreach Limiter - per-platform rate limiting and backoff
//!
//! This crate decides, for every outbound action a messaging platform
//! adapter wants to take, whether it may proceed now, must wait, or is
//! paused. Limits are per platform; counters live in a shared key-value
//! store so that independent workers enforce the same quotas.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{LimiterError, Result};
pub use ratelimit::{PlatformRegistry, RateLimitConfig, RateLimiter};
