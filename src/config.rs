//! Configuration loading and types for raftguard.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: node identity, cluster membership, Raft timing, the health
//! worker, log persistence, and the HTTP surface.

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::Deserialize;

use crate::raft::log::NodeInfo;

/// Highest node id accepted by `init` and the config loader.
pub const MAX_NODE_ID: u64 = 1000;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity of this node. When absent the node waits for an explicit
    /// `init` call on the control surface.
    #[serde(default)]
    pub node: Option<NodeConfig>,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cluster membership settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Raft timing and batching.
    #[serde(default)]
    pub raft: RaftConfig,

    /// Health worker settings.
    #[serde(default)]
    pub health: HealthConfig,

    /// Log store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: None,
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            raft: RaftConfig::default(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// This node's advertised identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Cluster-unique node id (1..=1000).
    pub id: u64,

    /// Address peers use to reach this node.
    #[serde(default = "default_address")]
    pub address: String,

    /// Port peers use to reach this node.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// A statically configured peer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u64,
    pub address: String,
    pub port: u16,
}

impl From<&PeerConfig> for NodeInfo {
    fn from(peer: &PeerConfig) -> Self {
        NodeInfo {
            id: peer.id,
            address: peer.address.clone(),
            port: peer.port,
        }
    }
}

impl From<&NodeConfig> for NodeInfo {
    fn from(node: &NodeConfig) -> Self {
        NodeInfo::new(node.id, node.address.clone(), node.port)
    }
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Human-readable cluster name, reported in logs.
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Initial voting members besides this node.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// When true this node is part of the initial voting set. A node that
    /// joins later sets this to false and waits until its own add-node
    /// entry is replicated to it before it may campaign.
    #[serde(default = "default_true")]
    pub bootstrap: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            peers: Vec::new(),
            bootstrap: true,
        }
    }
}

/// Raft timing configuration. All durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftConfig {
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// How often the driver advances timers.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Per-RPC deadline. An expired RPC counts as a lost message.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Maximum entries carried by one AppendEntries message.
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,

    /// How long a membership change waits for its entry to commit.
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            tick_interval_ms: default_tick_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            max_append_entries: default_max_append_entries(),
            proposal_timeout_ms: default_proposal_timeout(),
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
}

/// Health worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between health ticks.
    #[serde(default = "default_worker_interval")]
    pub worker_interval_ms: u64,

    /// Silence from the leader longer than this raises the failover
    /// condition in the health report.
    #[serde(default = "default_primary_failure_timeout")]
    pub primary_failure_timeout_ms: u64,

    /// Bounded retries for transport initialization.
    #[serde(default = "default_transport_init_attempts")]
    pub transport_init_attempts: u32,

    #[serde(default = "default_transport_init_backoff")]
    pub transport_init_backoff_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            worker_interval_ms: default_worker_interval(),
            primary_failure_timeout_ms: default_primary_failure_timeout(),
            transport_init_attempts: default_transport_init_attempts(),
            transport_init_backoff_ms: default_transport_init_backoff(),
        }
    }
}

/// Log store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Engine type: `sqlite` or `memory`.
    #[serde(default = "default_storage_engine")]
    pub engine: String,

    /// Path to the SQLite database file.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: default_storage_engine(),
            path: default_storage_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Start with diagnostic verbosity enabled.
    #[serde(default)]
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            debug: false,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7001
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_cluster_name() -> String {
    "main".to_string()
}

fn default_election_timeout_min() -> u64 {
    1000
}

fn default_election_timeout_max() -> u64 {
    2000
}

fn default_heartbeat_interval() -> u64 {
    100
}

fn default_tick_interval() -> u64 {
    20
}

fn default_rpc_timeout() -> u64 {
    500
}

fn default_max_append_entries() -> usize {
    64
}

fn default_proposal_timeout() -> u64 {
    5000
}

fn default_worker_interval() -> u64 {
    1000
}

fn default_primary_failure_timeout() -> u64 {
    5000
}

fn default_transport_init_attempts() -> u32 {
    5
}

fn default_transport_init_backoff() -> u64 {
    200
}

fn default_storage_engine() -> String {
    "sqlite".to_string()
}

fn default_storage_path() -> String {
    "./data/raft.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Validation --------------------------------------------------------------

impl Config {
    /// Reject configurations that would break Raft timing or identity rules.
    pub fn validate(&self) -> anyhow::Result<()> {
        let raft = &self.raft;
        if raft.election_timeout_min_ms == 0 {
            bail!("raft.election_timeout_min_ms must be positive");
        }
        if raft.election_timeout_min_ms > raft.election_timeout_max_ms {
            bail!(
                "raft.election_timeout_min_ms ({}) exceeds raft.election_timeout_max_ms ({})",
                raft.election_timeout_min_ms,
                raft.election_timeout_max_ms
            );
        }
        if raft.heartbeat_interval_ms == 0
            || raft.heartbeat_interval_ms * 2 > raft.election_timeout_min_ms
        {
            bail!(
                "raft.heartbeat_interval_ms ({}) must be positive and at most half of the minimum election timeout",
                raft.heartbeat_interval_ms
            );
        }
        if raft.tick_interval_ms == 0 || raft.tick_interval_ms > raft.heartbeat_interval_ms {
            bail!("raft.tick_interval_ms must be positive and no larger than the heartbeat interval");
        }
        if raft.max_append_entries == 0 {
            bail!("raft.max_append_entries must be positive");
        }
        if self.health.transport_init_attempts == 0 {
            bail!("health.transport_init_attempts must be at least 1");
        }

        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.cluster.peers {
            if !(1..=MAX_NODE_ID).contains(&peer.id) {
                bail!("peer id {} is outside 1..={}", peer.id, MAX_NODE_ID);
            }
            if !seen.insert(peer.id) {
                bail!("peer id {} is listed twice", peer.id);
            }
        }
        if let Some(node) = &self.node {
            if !(1..=MAX_NODE_ID).contains(&node.id) {
                bail!("node.id {} is outside 1..={}", node.id, MAX_NODE_ID);
            }
            if let Some(peer) = self.cluster.peers.iter().find(|p| p.id == node.id) {
                if peer.address != node.address || peer.port != node.port {
                    bail!(
                        "node {} is listed as a peer with a different address ({}:{})",
                        node.id,
                        peer.address,
                        peer.port
                    );
                }
            }
        }
        match self.storage.engine.as_str() {
            "sqlite" | "memory" => {}
            other => bail!("unknown storage.engine '{}'", other),
        }
        Ok(())
    }
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.raft.heartbeat_interval_ms, 100);
        assert_eq!(config.raft.election_timeout_min_ms, 1000);
        assert!(config.cluster.bootstrap);
        assert!(config.node.is_none());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
node:
  id: 2
  address: 10.0.0.2
  port: 7002
cluster:
  name: prod
  peers:
    - { id: 1, address: 10.0.0.1, port: 7001 }
    - { id: 3, address: 10.0.0.3, port: 7003 }
raft:
  election_timeout_min_ms: 500
  election_timeout_max_ms: 900
  heartbeat_interval_ms: 50
  tick_interval_ms: 10
storage:
  engine: memory
logging:
  format: json
  debug: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let node = config.node.as_ref().unwrap();
        assert_eq!(node.id, 2);
        assert_eq!(node.address, "10.0.0.2");
        assert_eq!(config.cluster.name, "prod");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.raft.heartbeat_interval(), Duration::from_millis(50));
        // Untouched fields keep their defaults.
        assert_eq!(config.raft.rpc_timeout_ms, 500);
        assert_eq!(config.storage.engine, "memory");
        assert!(config.logging.debug);
    }

    #[test]
    fn test_rejects_slow_heartbeat() {
        let mut config = Config::default();
        config.raft.heartbeat_interval_ms = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_election_range() {
        let mut config = Config::default();
        config.raft.election_timeout_min_ms = 3000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_peers_and_bad_ids() {
        let mut config = Config::default();
        let peer = PeerConfig {
            id: 2,
            address: "127.0.0.1".into(),
            port: 7002,
        };
        config.cluster.peers = vec![peer.clone(), peer];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node = Some(NodeConfig {
            id: 1001,
            address: "127.0.0.1".into(),
            port: 7001,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_engine() {
        let mut config = Config::default();
        config.storage.engine = "rocks".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raftguard.yaml");
        std::fs::write(&path, "node: { id: 1 }\nserver: { port: 7100 }\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.node.unwrap().id, 1);
        assert_eq!(config.server.port, 7100);
    }
}
