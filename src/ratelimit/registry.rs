//! Platform name to limit configuration mapping.
//!
//! The built-in table encodes safety margins measured against each
//! platform's own enforcement. Built-in entries can be extended with new
//! platforms at startup but never redefined.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::config::RateLimitConfig;
use super::limiter::{
    RateLimiter, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CEILING, DEFAULT_ERROR_COUNTER_TTL,
};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{LimiterError, Result};
use crate::store::StateStore;

/// (platform, requests/window, window secs, min delay ms, max delay ms, daily limit)
const BUILTIN_PLATFORMS: &[(&str, i64, i64, i64, i64, Option<i64>)] = &[
    ("telegram", 30, 60, 1_000, 3_000, None),
    ("twitter", 3, 60, 45_000, 90_000, Some(15)),
    ("linkedin", 2, 60, 30_000, 60_000, Some(10)),
    ("instagram", 2, 60, 30_000, 60_000, Some(20)),
    ("facebook", 2, 60, 30_000, 60_000, Some(30)),
    ("whatsapp", 2, 60, 30_000, 60_000, None),
    ("discord", 5, 5, 1_000, 2_000, None),
    ("teams", 60, 60, 500, 1_500, None),
    ("gmail", 100, 60, 100, 500, None),
];

/// Registry of platform limits, and factory for limiters bound to them.
///
/// Every limiter it hands out shares the registry's store and clock.
pub struct PlatformRegistry {
    platforms: BTreeMap<String, RateLimitConfig>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    error_counter_ttl: Duration,
}

impl PlatformRegistry {
    /// Create a registry holding the built-in platforms.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut platforms = BTreeMap::new();
        for &(name, requests, window, min_ms, max_ms, daily) in BUILTIN_PLATFORMS {
            let config = RateLimitConfig::new(requests, window, min_ms, max_ms, daily)?;
            platforms.insert(name.to_string(), config);
        }

        Ok(Self {
            platforms,
            store,
            clock,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            error_counter_ttl: DEFAULT_ERROR_COUNTER_TTL,
        })
    }

    /// Create a registry from service settings: built-ins, extra platforms,
    /// and the configured backoff and error-counter horizon.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut registry = Self::new(store, clock)?;
        registry.backoff_base = Duration::from_secs(settings.backoff.base_secs);
        registry.backoff_ceiling = Duration::from_secs(settings.backoff.max_secs);
        registry.error_counter_ttl = Duration::from_secs(settings.error_counter_ttl_secs);

        for (name, config) in &settings.platforms {
            registry.register(name, *config)?;
        }

        info!(platforms = registry.platforms.len(), "Platform registry loaded");
        Ok(registry)
    }

    /// Add a platform that is not already registered.
    pub fn register(&mut self, platform: &str, config: RateLimitConfig) -> Result<()> {
        if self.platforms.contains_key(platform) {
            return Err(LimiterError::Config(format!(
                "platform '{}' is already registered",
                platform
            )));
        }
        debug!(platform = %platform, config = ?config, "Registering platform");
        self.platforms.insert(platform.to_string(), config);
        Ok(())
    }

    /// Look up a platform's limits.
    pub fn config_for(&self, platform: &str) -> Result<&RateLimitConfig> {
        self.platforms
            .get(platform)
            .ok_or_else(|| LimiterError::UnknownPlatform(platform.to_string()))
    }

    /// Registered platforms in name order.
    pub fn platforms(&self) -> impl Iterator<Item = (&str, &RateLimitConfig)> {
        self.platforms
            .iter()
            .map(|(name, config)| (name.as_str(), config))
    }

    /// A limiter bound to `platform`'s limits.
    pub fn get_platform_rate_limiter(&self, platform: &str) -> Result<RateLimiter> {
        let config = *self.config_for(platform)?;
        Ok(RateLimiter::new(self.store.clone(), self.clock.clone())
            .with_config(config)
            .with_backoff(self.backoff_base, self.backoff_ceiling)
            .with_error_counter_ttl(self.error_counter_ttl))
    }
}
