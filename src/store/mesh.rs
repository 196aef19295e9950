//! Gossip-replicated store using Chitchat.
//!
//! Each node writes records into its own chitchat key-value state; chitchat
//! spreads them to every peer. A read looks at the record every live node
//! holds for the key and keeps the most recently written one, so concurrent
//! writers resolve as last-writer-wins. Expiry and deletion are carried in
//! the record envelope rather than by removing keys.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{StateStore, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

/// Configuration for a mesh store node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "outreach-limiter".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// What a node actually stores under a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    /// `None` marks a deletion
    value: Option<String>,
    written_at_ms: i64,
    expires_at_ms: i64,
}

/// A [`StateStore`] shared across processes through a chitchat cluster.
pub struct MeshStore {
    node_id: String,
    handle: ChitchatHandle,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MeshStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStore")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl MeshStore {
    /// Join (or found) the cluster described by `config`.
    pub async fn start(config: MeshConfig) -> StoreResult<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Start a node that timestamps and expires records with `clock`.
    pub async fn start_with_clock(
        config: MeshConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        info!(
            node = %config.node_id,
            gossip_addr = %config.listen_addr,
            peers = config.seed_nodes.len(),
            mesh = %config.cluster_id,
            "Joining state mesh"
        );

        let failure_detector_config = FailureDetectorConfig {
            initial_interval: config.gossip_interval,
            ..Default::default()
        };
        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id,
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes,
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "cannot join state mesh on {}: {}",
                    config.listen_addr, e
                ))
            })?;

        debug!(node = %config.node_id, "State mesh joined");
        Ok(Self {
            node_id: config.node_id,
            handle,
            clock,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat = self.handle.chitchat();
        let chitchat = chitchat.lock().await;
        chitchat.live_nodes().count()
    }

    /// Records this node currently holds, expired ones included.
    pub async fn local_record_count(&self) -> usize {
        let chitchat = self.handle.chitchat();
        let mut chitchat = chitchat.lock().await;
        chitchat.self_node_state().num_key_values()
    }

    /// Leave the mesh and stop gossiping.
    pub async fn shutdown(self) -> StoreResult<()> {
        info!(node = %self.node_id, "Leaving state mesh");
        self.handle.shutdown().await.map_err(|e| {
            StoreError::Unavailable(format!("state mesh did not stop cleanly: {:?}", e))
        })
    }

    /// Find the most recently written envelope for `key` across live nodes.
    fn freshest(chitchat: &chitchat::Chitchat, key: &str) -> Option<Envelope> {
        let mut best: Option<Envelope> = None;

        for node_id in chitchat.live_nodes() {
            let Some(raw) = chitchat.node_state(node_id).and_then(|state| state.get(key)) else {
                continue;
            };
            let envelope: Envelope = match serde_json::from_str(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        key = %key,
                        node = %node_id.node_id,
                        error = %e,
                        "Ignoring unreadable mesh record"
                    );
                    continue;
                }
            };
            if best
                .as_ref()
                .map_or(true, |b| envelope.written_at_ms > b.written_at_ms)
            {
                best = Some(envelope);
            }
        }

        best
    }

    /// Whether another live node holds an older record for `key` that is
    /// still unexpired, and would become visible if `own` disappeared.
    fn shadows_live_record(
        chitchat: &chitchat::Chitchat,
        self_id: &ChitchatId,
        key: &str,
        own: &Envelope,
        now_ms: i64,
    ) -> bool {
        chitchat
            .live_nodes()
            .filter(|node_id| *node_id != self_id)
            .filter_map(|node_id| chitchat.node_state(node_id)?.get(key))
            .filter_map(|raw| serde_json::from_str::<Envelope>(raw).ok())
            .any(|other| other.written_at_ms < own.written_at_ms && other.expires_at_ms > now_ms)
    }

    fn live_value(envelope: Option<Envelope>, now_ms: i64) -> Option<String> {
        envelope
            .filter(|e| e.expires_at_ms > now_ms)
            .and_then(|e| e.value)
    }

    fn write(
        &self,
        chitchat: &mut chitchat::Chitchat,
        key: &str,
        value: Option<String>,
        ttl: Duration,
    ) {
        let now_ms = self.clock.now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let envelope = Envelope {
            value,
            written_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        // Plain strings and integers always serialize.
        let encoded = serde_json::to_string(&envelope).unwrap_or_default();
        chitchat.self_node_state().set(key, encoded);
    }
}

#[async_trait]
impl StateStore for MeshStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let chitchat = self.handle.chitchat();
        let chitchat = chitchat.lock().await;
        let now_ms = self.clock.now().timestamp_millis();
        Ok(Self::live_value(Self::freshest(&chitchat, key), now_ms))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let chitchat = self.handle.chitchat();
        let mut chitchat = chitchat.lock().await;
        self.write(&mut chitchat, key, Some(value), ttl);
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Wrote mesh record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let chitchat = self.handle.chitchat();
        let mut chitchat = chitchat.lock().await;
        // Tombstones only need to outlive gossip propagation.
        self.write(&mut chitchat, key, None, Duration::from_secs(3600));
        debug!(key = %key, "Deleted mesh record");
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let chitchat = self.handle.chitchat();
        let mut chitchat = chitchat.lock().await;
        let now_ms = self.clock.now().timestamp_millis();

        let current = match Self::live_value(Self::freshest(&chitchat, key), now_ms) {
            Some(raw) => raw.parse::<u64>().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => 0,
        };

        let next = current.saturating_add(1);
        self.write(&mut chitchat, key, Some(next.to_string()), ttl);
        debug!(key = %key, value = next, "Incremented mesh counter");
        Ok(next)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let chitchat = self.handle.chitchat();
        let mut chitchat = chitchat.lock().await;
        let now_ms = self.clock.now().timestamp_millis();
        let self_id = chitchat.self_chitchat_id().clone();

        let expired: Vec<(String, Envelope)> = chitchat
            .self_node_state()
            .key_values()
            .filter_map(|(key, raw)| {
                let envelope: Envelope = serde_json::from_str(raw).ok()?;
                (envelope.expires_at_ms <= now_ms).then(|| (key.to_string(), envelope))
            })
            .collect();

        let mut removed = 0;
        for (key, envelope) in expired {
            if Self::shadows_live_record(&chitchat, &self_id, &key, &envelope, now_ms) {
                continue;
            }
            chitchat.self_node_state().delete(&key);
            removed += 1;
        }

        if removed > 0 {
            debug!(removed = removed, "Dropped expired mesh records");
        }
        Ok(removed)
    }
}
