//! Error types for the outreach limiter.

use thiserror::Error;

/// Main error type for limiter operations.
///
/// A denied action is not an error: `acquire` reports it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limit values, or a limit-aware call with no config available
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry lookup for a platform that is not registered
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// Bad caller input to the delay and backoff helpers
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
