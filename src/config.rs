//! Service settings for the outreach limiter.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed `OUTREACH__` with `__` between nested keys
//! (e.g. `OUTREACH__STORE__BACKEND=mesh`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::error::{LimiterError, Result};
use crate::ratelimit::RateLimitConfig;
use crate::store::{
    spawn_purge, MemoryStore, MeshConfig, MeshStore, StateStore, StoreError, StoreResult,
};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "OUTREACH";

/// Main settings for the limiter service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// State store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Exponential backoff constants
    #[serde(default)]
    pub backoff: BackoffSettings,

    /// How long a consecutive-error counter lives without new errors
    #[serde(default = "default_error_counter_ttl")]
    pub error_counter_ttl_secs: u64,

    /// Platforms added on top of the built-in table
    #[serde(default)]
    pub platforms: BTreeMap<String, RateLimitConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            backoff: BackoffSettings::default(),
            error_counter_ttl_secs: default_error_counter_ttl(),
            platforms: BTreeMap::new(),
        }
    }
}

/// Which store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Gossip-replicated cluster state
    Mesh,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub mesh: MeshSettings,

    /// Seconds between sweeps of expired entries; 0 disables sweeping
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            mesh: MeshSettings::default(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_purge_interval() -> u64 {
    60
}

impl StoreSettings {
    /// Open the configured backend and start sweeping its expired entries.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(&self, clock: Arc<dyn Clock>) -> StoreResult<ConfiguredStore> {
        let every = Duration::from_secs(self.purge_interval_secs);
        let (backend, purger) = match self.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::with_clock(clock));
                let purger = spawn_purge(&store, every);
                (Backend::Memory(store), purger)
            }
            StoreBackend::Mesh => {
                let config = self.mesh.to_mesh_config();
                let store = Arc::new(MeshStore::start_with_clock(config, clock).await?);
                let purger = spawn_purge(&store, every);
                (Backend::Mesh(store), purger)
            }
        };

        info!(
            backend = ?self.backend,
            purge_interval_secs = self.purge_interval_secs,
            "State store ready"
        );
        Ok(ConfiguredStore { backend, purger })
    }
}

enum Backend {
    Memory(Arc<MemoryStore>),
    Mesh(Arc<MeshStore>),
}

/// A state store opened from [`StoreSettings`], with its purge task.
pub struct ConfiguredStore {
    backend: Backend,
    purger: Option<JoinHandle<()>>,
}

impl ConfiguredStore {
    /// Which backend was opened.
    pub fn backend(&self) -> StoreBackend {
        match self.backend {
            Backend::Memory(_) => StoreBackend::Memory,
            Backend::Mesh(_) => StoreBackend::Mesh,
        }
    }

    /// The store, for handing to limiters and registries.
    pub fn state_store(&self) -> Arc<dyn StateStore> {
        match &self.backend {
            Backend::Memory(store) => store.clone(),
            Backend::Mesh(store) => store.clone(),
        }
    }

    /// The mesh node, when the mesh backend is in use.
    pub fn mesh(&self) -> Option<&MeshStore> {
        match &self.backend {
            Backend::Mesh(store) => Some(store.as_ref()),
            Backend::Memory(_) => None,
        }
    }

    /// Stop purging and, for the mesh backend, leave the mesh.
    ///
    /// Limiters built on this store must be dropped first.
    pub async fn shutdown(self) -> StoreResult<()> {
        if let Some(purger) = self.purger {
            purger.abort();
            let _ = purger.await;
        }

        match self.backend {
            Backend::Memory(_) => Ok(()),
            Backend::Mesh(store) => match Arc::try_unwrap(store) {
                Ok(store) => store.shutdown().await,
                Err(_) => Err(StoreError::Unavailable(
                    "mesh store is still shared by live limiters".to_string(),
                )),
            },
        }
    }
}

/// Mesh node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    /// Node identifier; a random one is generated when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers to contact on startup
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

impl MeshSettings {
    /// Build the node configuration for a mesh store.
    pub fn to_mesh_config(&self) -> MeshConfig {
        let mut config = MeshConfig {
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
            ..MeshConfig::default()
        };
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        config
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "outreach-limiter".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

/// Exponential backoff constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Delay after the first error
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,

    /// Ceiling for any backoff
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
        }
    }
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    900
}

fn default_error_counter_ttl() -> u64 {
    3600
}

impl Settings {
    /// Load settings from defaults, an optional file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.mesh.seed_nodes"),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(format!("Failed to load settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.backoff.max_secs < self.backoff.base_secs {
            return Err(LimiterError::Config(format!(
                "backoff.max_secs must be >= backoff.base_secs (got {} < {})",
                self.backoff.max_secs, self.backoff.base_secs
            )));
        }
        if self.store.backend == StoreBackend::Mesh && self.store.mesh.cluster_id.is_empty() {
            return Err(LimiterError::Config(
                "store.mesh.cluster_id must not be empty".to_string(),
            ));
        }
        if self.error_counter_ttl_secs == 0 {
            return Err(LimiterError::Config(
                "error_counter_ttl_secs must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
