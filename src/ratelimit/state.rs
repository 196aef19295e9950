//! Per account/action counters and their store encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Counters for one (account, action) pair.
///
/// The store owns the canonical copy; the limiter reads a whole record,
/// decides, and writes the whole record back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    /// Requests made in the current window
    pub request_count: u32,
    /// Start of the current counting window
    pub window_start: DateTime<Utc>,
    /// When the last permitted request happened
    pub last_request_at: Option<DateTime<Utc>>,
    /// Explicit pause flag
    pub is_paused: bool,
    /// When the explicit pause ends
    pub pause_until: Option<DateTime<Utc>>,
    /// Actions performed since the last daily reset
    pub daily_count: u32,
    /// Next daily reset instant
    pub daily_reset_at: Option<DateTime<Utc>>,
}

/// Stored representation. Every field is optional so that partial or older
/// records still load.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    request_count: Option<u32>,
    #[serde(default)]
    window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    last_request_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_paused: Option<bool>,
    #[serde(default)]
    pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    daily_count: Option<u32>,
    #[serde(default)]
    daily_reset_at: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Fresh state: zero counts, window starting at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_request_at: None,
            is_paused: false,
            pause_until: None,
            daily_count: 0,
            daily_reset_at: None,
        }
    }

    /// Decode a stored record.
    ///
    /// Missing fields take their defaults; an undecodable record is logged
    /// and replaced by fresh state.
    pub fn from_store_value(raw: &str, now: DateTime<Utc>) -> Self {
        let stored: StoredState = match serde_json::from_str(raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Discarding malformed rate limit state");
                return Self::new(now);
            }
        };

        Self {
            request_count: stored.request_count.unwrap_or(0),
            window_start: stored.window_start.unwrap_or(now),
            last_request_at: stored.last_request_at,
            is_paused: stored.is_paused.unwrap_or(false),
            pause_until: stored.pause_until,
            daily_count: stored.daily_count.unwrap_or(0),
            daily_reset_at: stored.daily_reset_at,
        }
    }

    /// Encode for the store.
    pub fn to_store_value(&self) -> String {
        let stored = StoredState {
            request_count: Some(self.request_count),
            window_start: Some(self.window_start),
            last_request_at: self.last_request_at,
            is_paused: Some(self.is_paused),
            pause_until: self.pause_until,
            daily_count: Some(self.daily_count),
            daily_reset_at: self.daily_reset_at,
        };
        // A struct of plain scalars and timestamps always serializes.
        serde_json::to_string(&stored).unwrap_or_default()
    }

    /// Whether an explicit pause is still in force at `now`.
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.is_paused && self.pause_until.map_or(false, |until| now < until)
    }

    pub fn clear_pause(&mut self) {
        self.is_paused = false;
        self.pause_until = None;
    }
}
