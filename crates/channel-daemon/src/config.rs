//! Daemon configuration file.
//!
//! ```toml
//! identity_path = "identity.key"
//!
//! [p2p]
//! hub_url = "ws://127.0.0.1:7400"
//! bootstrap = ["a1b2c3d4e5f67890"]
//! conns_low_watermark = 100
//!
//! [channels]
//! rejoin_interval_secs = 15
//! autojoin = ["#general"]
//! ```
//!
//! Every key is optional. Unknown keys are rejected so typos don't go unnoticed.

use channel_core::{Descriptor, NodeConfig, PeerId, PeerInfo};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:7400";
pub const DEFAULT_IDENTITY_PATH: &str = "identity.key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid bootstrap peer {0:?}")]
    InvalidPeer(String),

    #[error("Invalid autojoin channel {0:?}")]
    InvalidChannel(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub identity_path: Option<PathBuf>,
    pub p2p: P2pConfig,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct P2pConfig {
    pub hub_url: String,
    /// Peer IDs (hex) dialed at startup
    pub bootstrap: Vec<String>,
    pub conns_low_watermark: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_string(),
            bootstrap: Vec::new(),
            conns_low_watermark: NodeConfig::default().conns_low,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelsConfig {
    pub rejoin_interval_secs: u64,
    pub announce_interval_secs: u64,
    pub advertise_ttl_secs: u64,
    pub discovery_limit: usize,
    pub max_protected_peers: usize,
    /// Channels joined at startup
    pub autojoin: Vec<String>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            rejoin_interval_secs: node.rejoin_interval.as_secs(),
            announce_interval_secs: node.announce_interval.as_secs(),
            advertise_ttl_secs: node.advertise_ttl.as_secs(),
            discovery_limit: node.discovery_limit,
            max_protected_peers: node.max_protected_peers,
            autojoin: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY_PATH))
    }

    /// Build the core node configuration.
    pub fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let bootstrap = self
            .p2p
            .bootstrap
            .iter()
            .map(|raw| {
                raw.parse::<PeerId>()
                    .map(PeerInfo::new)
                    .map_err(|_| ConfigError::InvalidPeer(raw.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let channels = &self.channels;
        Ok(NodeConfig {
            bootstrap,
            conns_low: self.p2p.conns_low_watermark,
            rejoin_interval: Duration::from_secs(channels.rejoin_interval_secs.max(1)),
            announce_interval: Duration::from_secs(channels.announce_interval_secs.max(1)),
            advertise_ttl: Duration::from_secs(channels.advertise_ttl_secs),
            discovery_limit: channels.discovery_limit,
            max_protected_peers: channels.max_protected_peers,
            ..NodeConfig::default()
        })
    }

    /// Parse the autojoin list.
    pub fn autojoin(&self) -> Result<Vec<Descriptor>, ConfigError> {
        self.channels
            .autojoin
            .iter()
            .map(|raw| {
                Descriptor::parse(raw).map_err(|_| ConfigError::InvalidChannel(raw.clone()))
            })
            .collect()
    }
}
