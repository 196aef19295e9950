//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, info, trace, warn};

use super::config::RateLimitConfig;
use super::key::StoreKey;
use super::state::RateLimitState;
use crate::clock::Clock;
use crate::error::{LimiterError, Result};
use crate::store::StateStore;

/// Action type used when callers do not distinguish between actions.
pub const DEFAULT_ACTION: &str = "send";
/// Backoff after the first consecutive error.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound on any computed backoff.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(900);
/// How long a consecutive-error counter survives without new errors.
pub const DEFAULT_ERROR_COUNTER_TTL: Duration = Duration::from_secs(3600);

/// Read-only view of an account/action's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitStatus {
    /// Actions still permitted in the current window
    pub remaining: u32,
    /// Actions still permitted today, if a daily cap applies
    pub daily_remaining: Option<u32>,
    /// Whether an explicit pause is in force
    pub paused: bool,
    /// How long until `acquire` may succeed again
    pub wait: Duration,
}

/// The rate limiting decision engine.
///
/// The limiter holds no per-account state: every decision reads the
/// account's record from the store and, when it permits an action, writes
/// the whole record back. Instances can be shared across tasks, and any
/// number of instances may work against the same store.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    /// Config used when a call does not supply one
    config: Option<RateLimitConfig>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    error_counter_ttl: Duration,
}

impl RateLimiter {
    /// Create an unbound limiter. Limit-aware calls must then supply a config.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config: None,
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            error_counter_ttl: DEFAULT_ERROR_COUNTER_TTL,
        }
    }

    /// Bind a default config.
    pub fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the random source used for delays.
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    /// Override the backoff base and ceiling.
    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_ceiling = ceiling;
        self
    }

    /// Override how long consecutive-error counters live.
    pub fn with_error_counter_ttl(mut self, ttl: Duration) -> Self {
        self.error_counter_ttl = ttl;
        self
    }

    /// The bound config, if any.
    pub fn config(&self) -> Option<&RateLimitConfig> {
        self.config.as_ref()
    }

    /// Try to take one slot for `action` on `account`.
    ///
    /// Returns `Ok(false)` when the caller must not proceed yet (paused,
    /// window exhausted or daily cap reached). Never sleeps; use
    /// [`wait_if_needed`](Self::wait_if_needed) for the retry hint.
    pub async fn acquire(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<bool> {
        let config = self.resolve(config)?;
        let key = StoreKey::state(account, action);
        let now = self.clock.now();

        let Some(mut state) = self.load_state(&key, now).await else {
            return Ok(true);
        };

        if state.is_paused {
            if state.is_paused_at(now) {
                debug!(
                    account = %account,
                    action = %action,
                    until = ?state.pause_until,
                    "Requests paused"
                );
                return Ok(false);
            }
            state.clear_pause();
        }

        roll_window(&mut state, &config, now);

        if state.request_count >= config.requests_per_window() {
            debug!(
                account = %account,
                action = %action,
                count = state.request_count,
                limit = config.requests_per_window(),
                "Window limit reached"
            );
            return Ok(false);
        }

        if let Some(daily_limit) = config.daily_limit() {
            roll_daily(&mut state, now);
            if state.daily_count >= daily_limit {
                debug!(
                    account = %account,
                    action = %action,
                    count = state.daily_count,
                    limit = daily_limit,
                    "Daily limit reached"
                );
                return Ok(false);
            }
            state.daily_count += 1;
        }

        state.request_count += 1;
        state.last_request_at = Some(now);
        self.save_state(&key, &state, &config, now).await;

        trace!(
            account = %account,
            action = %action,
            count = state.request_count,
            daily_count = state.daily_count,
            "Request permitted"
        );
        Ok(true)
    }

    /// How long the caller should wait before calling `acquire` again.
    ///
    /// Zero means a slot is available now. Does not modify stored state.
    pub async fn wait_if_needed(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<Duration> {
        let config = self.resolve(config)?;
        let now = self.clock.now();
        let state = self.peek_state(account, action, now).await;
        Ok(wait_for(&state, &config, now))
    }

    /// Refuse every `acquire` for `action` on `account` during `duration`.
    ///
    /// Meant for hard throttling signals from the platform itself (e.g. HTTP 429).
    pub async fn pause_requests(
        &self,
        account: &str,
        duration: Duration,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<()> {
        let config = self.resolve(config)?;
        let key = StoreKey::state(account, action);
        let now = self.clock.now();

        let Some(mut state) = self.load_state(&key, now).await else {
            return Ok(());
        };

        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.is_paused = true;
        state.pause_until = Some(until);
        self.save_state(&key, &state, &config, now).await;

        info!(
            account = %account,
            action = %action,
            duration_secs = duration.as_secs(),
            "Paused requests"
        );
        Ok(())
    }

    /// Lift an explicit pause before it runs out.
    pub async fn resume_requests(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<()> {
        let config = self.resolve(config)?;
        let key = StoreKey::state(account, action);
        let now = self.clock.now();

        let Some(mut state) = self.load_state(&key, now).await else {
            return Ok(());
        };
        if !state.is_paused {
            return Ok(());
        }

        state.clear_pause();
        self.save_state(&key, &state, &config, now).await;
        info!(account = %account, action = %action, "Resumed requests");
        Ok(())
    }

    /// Uniform random delay in `[min_ms, max_ms]`.
    pub fn get_random_delay(&self, min_ms: i64, max_ms: i64) -> Result<Duration> {
        if min_ms < 0 {
            return Err(LimiterError::InvalidInput(format!(
                "min_ms must be >= 0 (got {})",
                min_ms
            )));
        }
        if max_ms < min_ms {
            return Err(LimiterError::InvalidInput(format!(
                "max_ms must be >= min_ms (got {} < {})",
                max_ms, min_ms
            )));
        }

        let (min_ms, max_ms) = (min_ms as u64, max_ms as u64);
        let millis = if min_ms == max_ms {
            min_ms
        } else {
            self.rng.lock().gen_range(min_ms..=max_ms)
        };
        Ok(Duration::from_millis(millis))
    }

    /// Human-like spacing between actions, drawn from the config's delay bounds.
    pub fn platform_delay(&self, config: Option<&RateLimitConfig>) -> Result<Duration> {
        let config = self.resolve(config)?;
        self.get_random_delay(config.min_delay_ms() as i64, config.max_delay_ms() as i64)
    }

    /// `base * 2^error_count`, capped at the ceiling. `error_count` is 0-indexed.
    pub fn calculate_exponential_backoff(&self, error_count: i64) -> Result<Duration> {
        if error_count < 0 {
            return Err(LimiterError::InvalidInput(format!(
                "error_count must be >= 0 (got {})",
                error_count
            )));
        }
        Ok(self.backoff(error_count as u64))
    }

    fn backoff(&self, error_count: u64) -> Duration {
        if error_count >= 32 {
            return self.backoff_ceiling;
        }
        self.backoff_base
            .checked_mul(1u32 << error_count)
            .map_or(self.backoff_ceiling, |delay| delay.min(self.backoff_ceiling))
    }

    /// Actions still permitted in the current window. Does not modify stored state.
    pub async fn get_remaining_requests(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<u32> {
        let config = self.resolve(config)?;
        let now = self.clock.now();
        let mut state = self.peek_state(account, action, now).await;
        roll_window(&mut state, &config, now);
        Ok(config.requests_per_window().saturating_sub(state.request_count))
    }

    /// Actions still permitted today, or `None` without a daily cap.
    /// Does not modify stored state.
    pub async fn get_daily_remaining(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<Option<u32>> {
        let config = self.resolve(config)?;
        let Some(daily_limit) = config.daily_limit() else {
            return Ok(None);
        };
        let now = self.clock.now();
        let mut state = self.peek_state(account, action, now).await;
        roll_daily(&mut state, now);
        Ok(Some(daily_limit.saturating_sub(state.daily_count)))
    }

    /// Full read-only snapshot for `action` on `account`.
    pub async fn status(
        &self,
        account: &str,
        action: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<LimitStatus> {
        let config = self.resolve(config)?;
        let now = self.clock.now();
        let state = self.peek_state(account, action, now).await;

        let wait = wait_for(&state, &config, now);
        let mut rolled = state.clone();
        roll_window(&mut rolled, &config, now);
        let daily_remaining = config.daily_limit().map(|limit| {
            roll_daily(&mut rolled, now);
            limit.saturating_sub(rolled.daily_count)
        });

        Ok(LimitStatus {
            remaining: config
                .requests_per_window()
                .saturating_sub(rolled.request_count),
            daily_remaining,
            paused: state.is_paused_at(now),
            wait,
        })
    }

    /// Record a failed platform call; returns the new consecutive-error count.
    ///
    /// Reports 0 if the store cannot be reached.
    pub async fn increment_error_count(&self, account: &str) -> u64 {
        let key = StoreKey::errors(account).to_store_key();
        match self.store.increment(&key, self.error_counter_ttl).await {
            Ok(count) => {
                debug!(account = %account, count = count, "Recorded platform error");
                count
            }
            Err(e) => {
                warn!(
                    account = %account,
                    error = %e,
                    "Failed to record platform error, ignoring"
                );
                0
            }
        }
    }

    /// Current consecutive-error count (0 when absent or unreachable).
    pub async fn get_error_count(&self, account: &str) -> u64 {
        let key = StoreKey::errors(account).to_store_key();
        match self.store.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
                warn!(account = %account, error = %e, "Ignoring malformed error counter");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!(
                    account = %account,
                    error = %e,
                    "Failed to read error counter, assuming none"
                );
                0
            }
        }
    }

    /// Forget consecutive errors after a successful platform call.
    pub async fn reset_error_count(&self, account: &str) {
        let key = StoreKey::errors(account).to_store_key();
        if let Err(e) = self.store.delete(&key).await {
            warn!(account = %account, error = %e, "Failed to reset error counter");
        }
    }

    /// Backoff for the account's current error streak; zero without errors.
    pub async fn backoff_for(&self, account: &str) -> Duration {
        match self.get_error_count(account).await {
            0 => Duration::ZERO,
            count => self.backoff(count - 1),
        }
    }

    fn resolve(&self, config: Option<&RateLimitConfig>) -> Result<RateLimitConfig> {
        config.or(self.config.as_ref()).copied().ok_or_else(|| {
            LimiterError::Config("no rate limit config bound or supplied".to_string())
        })
    }

    /// Load the record for `key`, or fresh state if none is stored.
    ///
    /// `None` means the store could not be read; callers fail open.
    async fn load_state(&self, key: &StoreKey, now: DateTime<Utc>) -> Option<RateLimitState> {
        match self.store.get(&key.to_store_key()).await {
            Ok(Some(raw)) => Some(RateLimitState::from_store_value(&raw, now)),
            Ok(None) => Some(RateLimitState::new(now)),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit store unavailable, failing open");
                None
            }
        }
    }

    /// Stored state for introspection; fresh state if it cannot be read.
    async fn peek_state(
        &self,
        account: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> RateLimitState {
        self.load_state(&StoreKey::state(account, action), now)
            .await
            .unwrap_or_else(|| RateLimitState::new(now))
    }

    async fn save_state(
        &self,
        key: &StoreKey,
        state: &RateLimitState,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) {
        let ttl = state_ttl(state, config, now);
        if let Err(e) = self
            .store
            .set(&key.to_store_key(), state.to_store_value(), ttl)
            .await
        {
            warn!(key = %key, error = %e, "Failed to persist rate limit state");
        }
    }
}

/// Start a new window if the current one has run out.
fn roll_window(state: &mut RateLimitState, config: &RateLimitConfig, now: DateTime<Utc>) {
    if now >= state.window_start + config.window() {
        trace!(previous_count = state.request_count, "Rolling rate limit window");
        state.request_count = 0;
        state.window_start = now;
    }
}

/// Reset the daily counter once the reset instant has passed.
fn roll_daily(state: &mut RateLimitState, now: DateTime<Utc>) {
    if state.daily_reset_at.map_or(true, |reset_at| now >= reset_at) {
        state.daily_count = 0;
        state.daily_reset_at = Some(next_local_midnight(now));
    }
}

fn wait_for(state: &RateLimitState, config: &RateLimitConfig, now: DateTime<Utc>) -> Duration {
    if state.is_paused_at(now) {
        if let Some(until) = state.pause_until {
            return until_std(until, now);
        }
    }

    let mut state = state.clone();
    roll_window(&mut state, config, now);
    if state.request_count >= config.requests_per_window() {
        return until_std(state.window_start + config.window(), now);
    }

    if let Some(daily_limit) = config.daily_limit() {
        roll_daily(&mut state, now);
        if state.daily_count >= daily_limit {
            if let Some(reset_at) = state.daily_reset_at {
                return until_std(reset_at, now);
            }
        }
    }

    Duration::ZERO
}

fn until_std(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Keep a record at least two windows, and long enough that an active
/// pause or the day's count is not dropped early.
fn state_ttl(state: &RateLimitState, config: &RateLimitConfig, now: DateTime<Utc>) -> Duration {
    let mut ttl = config.state_ttl();
    if let Some(until) = state.pause_until.filter(|_| state.is_paused) {
        ttl = ttl.max(until_std(until, now));
    }
    if config.daily_limit().is_some() {
        if let Some(reset_at) = state.daily_reset_at {
            ttl = ttl.max(until_std(reset_at, now));
        }
    }
    ttl
}

/// The first instant of the next local calendar day after `now`.
pub(crate) fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_timezone(&Local)
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| now + chrono::Duration::hours(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use rand::rngs::mock::StepRng;
    use tokio_test::{assert_err, assert_ok};

    fn morning() -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2024, 6, 12, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn twitter() -> RateLimitConfig {
        RateLimitConfig::new(3, 60, 45_000, 90_000, Some(15)).unwrap()
    }

    fn setup(config: RateLimitConfig) -> (RateLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(morning());
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter =
            RateLimiter::new(store.clone(), Arc::new(clock.clone())).with_config(config);
        (limiter, store, clock)
    }

    /// A store whose backend is always down.
    struct DownStore;

    #[async_trait]
    impl StateStore for DownStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn increment(&self, _key: &str, _ttl: Duration) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn purge_expired(&self) -> StoreResult<usize> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_window_limit_then_rollover() {
        let (limiter, _store, clock) = setup(twitter());

        for i in 1..=3 {
            assert!(
                limiter.acquire("acct", "send", None).await.unwrap(),
                "call {} should pass",
                i
            );
        }
        assert!(!limiter.acquire("acct", "send", None).await.unwrap());

        let wait = limiter.wait_if_needed("acct", "send", None).await.unwrap();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(60));

        clock.advance(chrono::Duration::seconds(61));
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
        assert_eq!(
            limiter.wait_if_needed("acct", "send", None).await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_accounts_and_actions_are_independent() {
        let config = RateLimitConfig::new(1, 60, 0, 0, None).unwrap();
        let (limiter, _store, _clock) = setup(config);

        assert!(limiter.acquire("a", "send", None).await.unwrap());
        assert!(!limiter.acquire("a", "send", None).await.unwrap());
        assert!(limiter.acquire("a", "poll", None).await.unwrap());
        assert!(limiter.acquire("b", "send", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delimiter_in_ids_keeps_pairs_independent() {
        let config = RateLimitConfig::new(1, 60, 0, 0, None).unwrap();
        let (limiter, _store, _clock) = setup(config);

        assert!(limiter.acquire("team|alice", "send", None).await.unwrap());
        assert!(limiter.acquire("team", "alice|send", None).await.unwrap());
        assert!(!limiter.acquire("team|alice", "send", None).await.unwrap());
        assert!(!limiter.acquire("team", "alice|send", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_accounts_are_purged() {
        let (limiter, store, clock) = setup(twitter());

        for i in 0..1000 {
            let account = format!("acct-{}", i);
            assert!(limiter.acquire(&account, "send", None).await.unwrap());
        }
        limiter.increment_error_count("acct-0").await;
        assert_eq!(store.len(), 1001);

        clock.advance(chrono::Duration::days(30));
        assert_eq!(store.purge_expired().await.unwrap(), 1001);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_daily_cap_across_windows() {
        let (limiter, _store, clock) = setup(twitter());

        let mut permitted = 0;
        for _ in 0..6 {
            for _ in 0..3 {
                if limiter.acquire("acct", "send", None).await.unwrap() {
                    permitted += 1;
                }
            }
            clock.advance(chrono::Duration::seconds(61));
        }
        assert_eq!(permitted, 15);

        // Fresh window, but the day is spent
        assert_eq!(limiter.get_remaining_requests("acct", "send", None).await.unwrap(), 3);
        assert!(!limiter.acquire("acct", "send", None).await.unwrap());
        assert_eq!(
            limiter.get_daily_remaining("acct", "send", None).await.unwrap(),
            Some(0)
        );

        let reset_at = next_local_midnight(clock.now());
        let wait = limiter.wait_if_needed("acct", "send", None).await.unwrap();
        assert_eq!(wait, until_std(reset_at, clock.now()));

        clock.set(reset_at + chrono::Duration::seconds(1));
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
        assert_eq!(
            limiter.get_daily_remaining("acct", "send", None).await.unwrap(),
            Some(14)
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_then_expires() {
        let (limiter, _store, clock) = setup(twitter());

        limiter
            .pause_requests("acct", Duration::from_secs(10), "send", None)
            .await
            .unwrap();
        assert!(!limiter.acquire("acct", "send", None).await.unwrap());
        assert_eq!(
            limiter.wait_if_needed("acct", "send", None).await.unwrap(),
            Duration::from_secs(10)
        );

        clock.advance(chrono::Duration::seconds(9));
        assert!(!limiter.acquire("acct", "send", None).await.unwrap());

        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
        assert!(!limiter.status("acct", "send", None).await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_long_pause_outlives_state_ttl() {
        let config = RateLimitConfig::new(5, 5, 0, 0, None).unwrap();
        let (limiter, _store, clock) = setup(config);

        limiter
            .pause_requests("acct", Duration::from_secs(300), "send", None)
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(120));
        assert!(!limiter.acquire("acct", "send", None).await.unwrap());
        clock.advance(chrono::Duration::seconds(180));
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_lifts_pause() {
        let (limiter, _store, _clock) = setup(twitter());

        limiter
            .pause_requests("acct", Duration::from_secs(600), "send", None)
            .await
            .unwrap();
        assert!(limiter.status("acct", "send", None).await.unwrap().paused);

        limiter.resume_requests("acct", "send", None).await.unwrap();
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_introspection_has_no_side_effects() {
        let (limiter, store, clock) = setup(twitter());

        for _ in 0..3 {
            limiter.acquire("acct", "send", None).await.unwrap();
        }
        clock.advance(chrono::Duration::seconds(61));

        let key = StoreKey::state("acct", "send").to_store_key();
        let before = store.get(&key).await.unwrap();

        assert_eq!(limiter.get_remaining_requests("acct", "send", None).await.unwrap(), 3);
        assert_eq!(
            limiter.get_daily_remaining("acct", "send", None).await.unwrap(),
            Some(12)
        );
        let status = limiter.status("acct", "send", None).await.unwrap();
        assert_eq!(status.remaining, 3);
        assert_eq!(status.wait, Duration::ZERO);
        limiter.wait_if_needed("acct", "send", None).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), before);
        assert!(limiter.acquire("acct", "send", None).await.unwrap());
        assert_eq!(limiter.get_remaining_requests("acct", "send", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_introspection_on_unknown_account() {
        let (limiter, store, _clock) = setup(twitter());

        let status = limiter.status("nobody", "send", None).await.unwrap();
        assert_eq!(
            status,
            LimitStatus {
                remaining: 3,
                daily_remaining: Some(15),
                paused: false,
                wait: Duration::ZERO,
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_supplied_config_overrides_bound_one() {
        let (limiter, _store, _clock) = setup(twitter());
        let strict = RateLimitConfig::new(1, 60, 0, 0, None).unwrap();

        assert!(limiter.acquire("acct", "poll", Some(&strict)).await.unwrap());
        assert!(!limiter.acquire("acct", "poll", Some(&strict)).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let clock = ManualClock::new(morning());
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(clock));

        let result = limiter.acquire("acct", "send", None).await;
        assert!(matches!(result, Err(LimiterError::Config(_))));
        assert_err!(limiter.wait_if_needed("acct", "send", None).await);
        assert_err!(limiter.get_remaining_requests("acct", "send", None).await);
        assert_err!(
            limiter
                .pause_requests("acct", Duration::from_secs(1), "send", None)
                .await
        );
        assert_err!(limiter.platform_delay(None));
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let clock = ManualClock::new(morning());
        let limiter =
            RateLimiter::new(Arc::new(DownStore), Arc::new(clock)).with_config(twitter());

        for _ in 0..10 {
            assert!(assert_ok!(limiter.acquire("acct", "send", None).await));
        }
        assert_ok!(
            limiter
                .pause_requests("acct", Duration::from_secs(30), "send", None)
                .await
        );
        assert_eq!(
            assert_ok!(limiter.wait_if_needed("acct", "send", None).await),
            Duration::ZERO
        );
        assert_eq!(limiter.increment_error_count("acct").await, 0);
        assert_eq!(limiter.get_error_count("acct").await, 0);
        limiter.reset_error_count("acct").await;
        assert_err!(DownStore.purge_expired().await);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_limit() {
        let discord = RateLimitConfig::new(5, 5, 1000, 2000, None).unwrap();
        let (limiter, _store, _clock) = setup(discord);

        let results = futures::future::join_all(
            (0..20).map(|_| limiter.acquire("shared", "send", None)),
        )
        .await;

        let permitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(permitted, 5);
    }

    #[test]
    fn test_exponential_backoff() {
        let (limiter, _store, _clock) = setup(twitter());

        assert_eq!(limiter.calculate_exponential_backoff(0).unwrap(), Duration::from_secs(1));
        assert_eq!(limiter.calculate_exponential_backoff(3).unwrap(), Duration::from_secs(8));
        assert_eq!(limiter.calculate_exponential_backoff(9).unwrap(), Duration::from_secs(512));
        assert_eq!(limiter.calculate_exponential_backoff(10).unwrap(), Duration::from_secs(900));
        assert_eq!(limiter.calculate_exponential_backoff(20).unwrap(), Duration::from_secs(900));
        assert_eq!(limiter.calculate_exponential_backoff(500).unwrap(), Duration::from_secs(900));
        assert!(matches!(
            limiter.calculate_exponential_backoff(-1),
            Err(LimiterError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_custom_backoff_constants() {
        let (limiter, _store, _clock) = setup(twitter());
        let limiter = limiter.with_backoff(Duration::from_secs(2), Duration::from_secs(60));

        assert_eq!(limiter.calculate_exponential_backoff(0).unwrap(), Duration::from_secs(2));
        assert_eq!(limiter.calculate_exponential_backoff(4).unwrap(), Duration::from_secs(32));
        assert_eq!(limiter.calculate_exponential_backoff(5).unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_random_delay_bounds() {
        let (limiter, _store, _clock) = setup(twitter());
        let limiter = limiter.with_rng(StdRng::seed_from_u64(7));

        assert_eq!(limiter.get_random_delay(1000, 1000).unwrap().as_secs_f64(), 1.0);
        for _ in 0..200 {
            let delay = limiter.get_random_delay(100, 500).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(500));
        }

        assert!(matches!(
            limiter.get_random_delay(100, 50),
            Err(LimiterError::InvalidInput(_))
        ));
        assert!(matches!(
            limiter.get_random_delay(-5, 50),
            Err(LimiterError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_random_delay_with_zero_source_returns_min() {
        let (limiter, _store, _clock) = setup(twitter());
        let limiter = limiter.with_rng(StepRng::new(0, 0));

        assert_eq!(
            limiter.get_random_delay(30_000, 60_000).unwrap(),
            Duration::from_millis(30_000)
        );
        assert_eq!(limiter.platform_delay(None).unwrap(), Duration::from_millis(45_000));
    }

    #[tokio::test]
    async fn test_error_counter_lifecycle() {
        let (limiter, _store, clock) = setup(twitter());

        assert_eq!(limiter.backoff_for("acct").await, Duration::ZERO);

        assert_eq!(limiter.increment_error_count("acct").await, 1);
        assert_eq!(limiter.backoff_for("acct").await, Duration::from_secs(1));
        assert_eq!(limiter.increment_error_count("acct").await, 2);
        assert_eq!(limiter.increment_error_count("acct").await, 3);
        assert_eq!(limiter.get_error_count("acct").await, 3);
        assert_eq!(limiter.backoff_for("acct").await, Duration::from_secs(4));

        limiter.reset_error_count("acct").await;
        assert_eq!(limiter.get_error_count("acct").await, 0);

        // Counters lapse after an hour without errors
        limiter.increment_error_count("acct").await;
        clock.advance(chrono::Duration::minutes(61));
        assert_eq!(limiter.get_error_count("acct").await, 0);
    }

    #[tokio::test]
    async fn test_state_expires_after_two_windows() {
        let config = RateLimitConfig::new(2, 60, 0, 0, None).unwrap();
        let (limiter, store, clock) = setup(config);

        limiter.acquire("acct", "send", None).await.unwrap();
        let key = StoreKey::state("acct", "send").to_store_key();

        clock.advance(chrono::Duration::seconds(119));
        assert!(store.get(&key).await.unwrap().is_some());
        clock.advance(chrono::Duration::seconds(1));
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[test]
    fn test_next_local_midnight() {
        let now = morning();
        let midnight = next_local_midnight(now);
        let local = midnight.with_timezone(&Local);

        assert!(midnight > now);
        assert!(midnight - now <= chrono::Duration::hours(25));
        assert_eq!(
            local.date_naive(),
            now.with_timezone(&Local).date_naive().succ_opt().unwrap()
        );
        assert_eq!(local.time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }
}
