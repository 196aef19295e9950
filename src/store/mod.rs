//! Key-value persistence behind the limiter.
//!
//! The [`StateStore`] trait is the only seam between the limiter and shared
//! storage. [`MemoryStore`] keeps everything in-process; [`MeshStore`] shares
//! records between processes over a gossip cluster.
//!
//! Expiry is judged on read, so an entry nobody reads again stays in memory
//! until [`StateStore::purge_expired`] runs; [`spawn_purge`] runs it on a timer.

mod memory;
mod mesh;

pub use memory::MemoryStore;
pub use mesh::{MeshConfig, MeshStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value store with per-entry expiry.
///
/// Values are the store's native string representation. Implementations must
/// be safe to share across tasks.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value; expired or missing entries are `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value that expires `ttl` after this write.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Add one to an integer value (absent counts as zero), refresh its
    /// expiry to `ttl`, and return the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Physically remove expired entries and return how many were dropped.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// Purge `store` every `every` on a background task.
///
/// The task holds only a weak reference and stops once the store is dropped.
/// A zero interval disables purging and returns `None`.
pub fn spawn_purge<S>(store: &Arc<S>, every: Duration) -> Option<JoinHandle<()>>
where
    S: StateStore + 'static,
{
    if every == Duration::ZERO {
        return None;
    }

    let store = Arc::downgrade(store);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(store) = store.upgrade() else {
                debug!("Store dropped, stopping purge task");
                break;
            };
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed = removed, "Purged expired store entries"),
                Err(e) => warn!(error = %e, "Store purge failed"),
            }
        }
    }))
}
