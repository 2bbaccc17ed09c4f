//! Node configuration with TOML file support.

use std::net::SocketAddr;
use std::path::Path;

use halyard_mempool::MempoolConfig;
use halyard_network::MConnConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;
use crate::NodeError;

/// Configuration for a Halyard node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Log format: "human" or "json".
    #[serde(default)]
    pub log_format: LogFormat,

    /// Log level filter, e.g. "info" or "debug,halyard_mempool=trace".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to keep Prometheus metrics.
    #[serde(default)]
    pub metrics: bool,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub mempool: MempoolConfig,
}

/// Peer-to-peer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Address to accept peer connections on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peers dialed on startup, as "host:port".
    #[serde(default)]
    pub persistent_peers: Vec<String>,

    /// Maximum number of connected peers, inbound and outbound together.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// No consensus engine reports peer heights: treat every peer as
    /// caught up.
    #[serde(default = "default_true")]
    pub standalone: bool,

    #[serde(default)]
    pub connection: MConnConfig,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen_addr() -> String {
    "127.0.0.1:26656".to_string()
}

fn default_max_peers() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        self.p2p.connection.validate()?;
        if self.p2p.max_peers == 0 {
            return Err(NodeError::Config("p2p.max_peers must be positive".into()));
        }
        self.p2p.listen_socket_addr()?;
        Ok(())
    }
}

impl P2pConfig {
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, NodeError> {
        self.listen_addr.parse().map_err(|e| {
            NodeError::Config(format!("invalid p2p.listen_addr {:?}: {e}", self.listen_addr))
        })
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            persistent_peers: Vec::new(),
            max_peers: default_max_peers(),
            standalone: default_true(),
            connection: MConnConfig::default(),
        }
    }
}
