//! Runtime configuration for the node.
//!
//! Loaded once from a TOML file and held in a process-wide instance.

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// A statically declared cluster peer.
#[derive(Debug, Deserialize, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// This node's name. Member identity is derived from it.
    pub name: String,
    /// Chain identifier shared by every member of the cluster.
    pub chain_id: String,
    /// Bind address for the raft and application gRPC server.
    pub listen_url: String,
    /// Bind address for the metrics endpoint.
    pub metrics_addr: String,
    /// Base directory for durable state.
    pub base_path: String,
    /// true bootstraps a new cluster, false joins an existing one.
    #[serde(default)]
    pub new_cluster: bool,
    /// Optional TLS for the gRPC server. Both must be set to take effect.
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    /// Block production period on the leader, in milliseconds.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    /// Raft library tick period, in milliseconds.
    #[serde(default = "default_raft_tick_ms")]
    pub raft_tick_ms: u64,
    /// When true the leader does not propose blocks with an empty body.
    #[serde(default)]
    pub skip_empty_block: bool,
    /// Applied entries between snapshot creations.
    #[serde(default = "default_snap_frequency")]
    pub snap_frequency: u64,
    /// Entries retained past a snapshot for slow followers.
    #[serde(default = "default_catch_up_entries")]
    pub catch_up_entries: u64,
    /// Every member of the cluster, this node included.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_block_interval_ms() -> u64 {
    1000
}

fn default_raft_tick_ms() -> u64 {
    100
}

fn default_snap_frequency() -> u64 {
    10
}

fn default_catch_up_entries() -> u64 {
    10
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            name: "node1".to_string(),
            chain_id: "blockraft-dev".to_string(),
            listen_url: "127.0.0.1:11001".to_string(),
            metrics_addr: "127.0.0.1:11011".to_string(),
            base_path: "./data".to_string(),
            new_cluster: true,
            cert_file: String::new(),
            key_file: String::new(),
            block_interval_ms: default_block_interval_ms(),
            raft_tick_ms: default_raft_tick_ms(),
            skip_empty_block: false,
            snap_frequency: default_snap_frequency(),
            catch_up_entries: default_catch_up_entries(),
            peers: Vec::new(),
        }
    }

    /// Loads configuration from a TOML file and installs it as the global
    /// instance. Falls back to defaults when the file cannot be read.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not read the runtime config file, {:?}", e);
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!("could not parse the runtime config file, {:?}", e);
                return Some(RuntimeConfig::new());
            }
        };
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }

    /// TLS is enabled only when both file paths are configured.
    pub fn tls_enabled(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}
