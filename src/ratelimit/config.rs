//! Per-platform limit configuration.

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Validated limits for one platform.
///
/// Values are fixed at construction; a config is either fully valid or
/// never built. Deserialization goes through [`RawRateLimitConfig`] so that
/// file input is checked by the same rules as [`RateLimitConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig", into = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    requests_per_window: u32,
    window_seconds: u64,
    min_delay_ms: u64,
    max_delay_ms: u64,
    daily_limit: Option<u32>,
}

/// Unvalidated, signed form of a [`RateLimitConfig`] as it appears in files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawRateLimitConfig {
    pub requests_per_window: i64,
    pub window_seconds: i64,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    #[serde(default)]
    pub daily_limit: Option<i64>,
}

impl RateLimitConfig {
    /// Build a config, rejecting values that violate any limit constraint.
    pub fn new(
        requests_per_window: i64,
        window_seconds: i64,
        min_delay_ms: i64,
        max_delay_ms: i64,
        daily_limit: Option<i64>,
    ) -> Result<Self> {
        if requests_per_window < 1 {
            return Err(LimiterError::Config(format!(
                "requests_per_window must be >= 1 (got {})",
                requests_per_window
            )));
        }
        if window_seconds < 1 {
            return Err(LimiterError::Config(format!(
                "window_seconds must be >= 1 (got {})",
                window_seconds
            )));
        }
        if min_delay_ms < 0 {
            return Err(LimiterError::Config(format!(
                "min_delay_ms must be >= 0 (got {})",
                min_delay_ms
            )));
        }
        if max_delay_ms < min_delay_ms {
            return Err(LimiterError::Config(format!(
                "max_delay_ms must be >= min_delay_ms (got {} < {})",
                max_delay_ms, min_delay_ms
            )));
        }
        if let Some(daily) = daily_limit {
            if daily < 1 {
                return Err(LimiterError::Config(format!(
                    "daily_limit must be >= 1 when set (got {})",
                    daily
                )));
            }
        }

        if window_seconds > u32::MAX as i64 {
            return Err(LimiterError::Config(format!(
                "window_seconds out of range (got {})",
                window_seconds
            )));
        }

        let requests_per_window = u32::try_from(requests_per_window).map_err(|_| {
            LimiterError::Config(format!(
                "requests_per_window out of range (got {})",
                requests_per_window
            ))
        })?;
        let daily_limit = daily_limit
            .map(|daily| {
                u32::try_from(daily).map_err(|_| {
                    LimiterError::Config(format!("daily_limit out of range (got {})", daily))
                })
            })
            .transpose()?;

        Ok(Self {
            requests_per_window,
            window_seconds: window_seconds as u64,
            min_delay_ms: min_delay_ms as u64,
            max_delay_ms: max_delay_ms as u64,
            daily_limit,
        })
    }

    /// Maximum actions allowed per window.
    pub fn requests_per_window(&self) -> u32 {
        self.requests_per_window
    }

    /// Window length in seconds.
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn min_delay_ms(&self) -> u64 {
        self.min_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Actions allowed per local calendar day, if capped.
    pub fn daily_limit(&self) -> Option<u32> {
        self.daily_limit
    }

    /// Window length as a `chrono` duration.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_seconds as i64)
    }

    /// How long window and daily state is kept in the store after its last write.
    pub fn state_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds.saturating_mul(2))
    }
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = LimiterError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        Self::new(
            raw.requests_per_window,
            raw.window_seconds,
            raw.min_delay_ms,
            raw.max_delay_ms,
            raw.daily_limit,
        )
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_window as i64,
            window_seconds: config.window_seconds as i64,
            min_delay_ms: config.min_delay_ms as i64,
            max_delay_ms: config.max_delay_ms as i64,
            daily_limit: config.daily_limit.map(i64::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_error(result: Result<RateLimitConfig>) -> String {
        match result {
            Err(LimiterError::Config(msg)) => msg,
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = RateLimitConfig::new(3, 60, 45_000, 90_000, Some(15)).unwrap();
        assert_eq!(config.requests_per_window(), 3);
        assert_eq!(config.window_seconds(), 60);
        assert_eq!(config.min_delay_ms(), 45_000);
        assert_eq!(config.max_delay_ms(), 90_000);
        assert_eq!(config.daily_limit(), Some(15));
        assert_eq!(config.state_ttl(), std::time::Duration::from_secs(120));
    }

    #[test]
    fn test_equal_delay_bounds_allowed() {
        assert!(RateLimitConfig::new(1, 1, 0, 0, None).is_ok());
    }

    #[test]
    fn test_each_violation_names_its_constraint() {
        assert!(config_error(RateLimitConfig::new(0, 60, 0, 0, None))
            .contains("requests_per_window"));
        assert!(config_error(RateLimitConfig::new(1, 0, 0, 0, None)).contains("window_seconds"));
        assert!(config_error(RateLimitConfig::new(1, 60, -1, 0, None)).contains("min_delay_ms"));
        assert!(config_error(RateLimitConfig::new(1, 60, 500, 100, None))
            .contains("max_delay_ms"));
        assert!(config_error(RateLimitConfig::new(1, 60, 0, 0, Some(0))).contains("daily_limit"));
    }

    #[test]
    fn test_yaml_goes_through_validation() {
        let yaml = r#"
requests_per_window: 5
window_seconds: 10
min_delay_ms: 100
max_delay_ms: 200
"#;
        let config: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.requests_per_window(), 5);
        assert_eq!(config.daily_limit(), None);

        let bad = r#"
requests_per_window: 5
window_seconds: 10
min_delay_ms: 300
max_delay_ms: 200
"#;
        let err = serde_yaml::from_str::<RateLimitConfig>(bad).unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));
    }
}
