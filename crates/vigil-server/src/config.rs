//! Server configuration.
//!
//! [`VigilConfig`] mirrors the TOML file and holds raw, human-friendly
//! values ("500ms", "1:127.0.0.1:12000"). [`VigilConfig::validate`] turns
//! it into [`Settings`], the typed form the rest of the server uses.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_cluster::{ClusterState, RaftConfig};
use vigil_core::{parse_peers, NodeOptions, Peer, SupervisorConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// How configured masters combine with the replicated set at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MastersState {
    /// Replace the set with the configured masters.
    New,
    /// Add the configured masters to whatever is already there.
    #[default]
    Existing,
}

impl FromStr for MastersState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(MastersState::New),
            "existing" => Ok(MastersState::Existing),
            other => Err(format!("unknown masters state '{other}' (expected new or existing)")),
        }
    }
}

impl fmt::Display for MastersState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MastersState::New => f.write_str("new"),
            MastersState::Existing => f.write_str("existing"),
        }
    }
}

/// `[node]` section: how store nodes are contacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub attempts: u32,
    pub connect_timeout: String,
    pub io_timeout: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: "5s".into(),
            io_timeout: "5s".into(),
        }
    }
}

/// `[raft]` section: consensus timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    pub heartbeat_interval: String,
    pub election_timeout_min: String,
    pub election_timeout_max: String,
    pub snapshot_threshold: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: "500ms".into(),
            election_timeout_min: "1500ms".into(),
            election_timeout_max: "3000ms".into(),
            snapshot_threshold: 1024,
        }
    }
}

/// The configuration file, with defaults for everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// HTTP control plane listen address.
    pub addr: String,
    pub data_dir: String,
    pub server_id: u64,
    /// Raft peers as `ID:host:port`. Empty runs without consensus.
    pub cluster: Vec<String>,
    pub cluster_state: ClusterState,
    pub masters: Vec<String>,
    pub masters_state: MastersState,
    pub check_interval: String,
    pub follow_promoted: bool,
    /// Dedicated port for `/metrics` and `/health`. The control plane
    /// serves both regardless.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
    pub node: NodeSection,
    pub raft: RaftSection,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:11000".into(),
            data_dir: "./var".into(),
            server_id: 1,
            cluster: Vec::new(),
            cluster_state: ClusterState::Existing,
            masters: Vec::new(),
            masters_state: MastersState::Existing,
            check_interval: "1s".into(),
            follow_promoted: true,
            metrics_port: None,
            node: NodeSection::default(),
            raft: RaftSection::default(),
        }
    }
}

/// Validated, typed settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    pub masters: Vec<String>,
    pub masters_state: MastersState,
    pub metrics_addr: Option<SocketAddr>,
    pub supervisor: SupervisorConfig,
    /// `None` when no cluster peers are configured.
    pub raft: Option<RaftConfig>,
}

impl VigilConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| invalid("addr", format!("'{}': {e}", self.addr)))?;

        if self.data_dir.trim().is_empty() {
            return Err(invalid("data_dir", "must not be empty"));
        }
        let data_dir = PathBuf::from(&self.data_dir);

        if self.node.attempts == 0 {
            return Err(invalid("node.attempts", "must be at least 1"));
        }
        let node = NodeOptions {
            attempts: self.node.attempts,
            connect_timeout: nonzero("node.connect_timeout", &self.node.connect_timeout)?,
            io_timeout: nonzero("node.io_timeout", &self.node.io_timeout)?,
        };
        let supervisor = SupervisorConfig {
            check_interval: nonzero("check_interval", &self.check_interval)?,
            follow_promoted: self.follow_promoted,
            node,
        };

        let masters = vigil_core::masters::normalize(self.masters.as_slice())
            .map_err(|e| invalid("masters", e.to_string()))?;

        let metrics_addr = self
            .metrics_port
            .map(|port| SocketAddr::new(addr.ip(), port));

        let peers = parse_peers(&self.cluster).map_err(|e| invalid("cluster", e.to_string()))?;
        let raft = if peers.is_empty() {
            None
        } else {
            Some(self.raft_config(&data_dir, peers)?)
        };

        Ok(Settings {
            addr,
            data_dir,
            masters,
            masters_state: self.masters_state,
            metrics_addr,
            supervisor,
            raft,
        })
    }

    fn raft_config(&self, data_dir: &Path, peers: Vec<Peer>) -> Result<RaftConfig, ConfigError> {
        if !peers.iter().any(|p| p.id == self.server_id) {
            return Err(invalid(
                "cluster",
                format!("server_id {} is not in the peer list", self.server_id),
            ));
        }
        vigil_cluster::peers::validate_peers(&peers)
            .map_err(|e| invalid("cluster", e.to_string()))?;

        let heartbeat = nonzero("raft.heartbeat_interval", &self.raft.heartbeat_interval)?;
        let min = nonzero("raft.election_timeout_min", &self.raft.election_timeout_min)?;
        let max = nonzero("raft.election_timeout_max", &self.raft.election_timeout_max)?;
        if min >= max {
            return Err(invalid(
                "raft.election_timeout_min",
                "must be less than election_timeout_max",
            ));
        }
        if self.raft.snapshot_threshold == 0 {
            return Err(invalid("raft.snapshot_threshold", "must be at least 1"));
        }

        let mut config = RaftConfig::new(self.server_id, data_dir, peers);
        config.state = self.cluster_state;
        config.heartbeat_interval = heartbeat;
        config.election_timeout_min = min;
        config.election_timeout_max = max;
        config.snapshot_threshold = self.raft.snapshot_threshold;
        Ok(config)
    }
}

fn nonzero(field: &'static str, input: &str) -> Result<Duration, ConfigError> {
    let d = parse_duration(input).map_err(|e| invalid(field, e))?;
    if d.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(d)
}

/// Parses a duration like "500ms", "1s", "2m", or "1h". A bare number is
/// seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".into());
    }

    let (num, unit_ms) = if let Some(n) = input.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = input.strip_suffix('s') {
        (n, 1000)
    } else if let Some(n) = input.strip_suffix('m') {
        (n, 60 * 1000)
    } else if let Some(n) = input.strip_suffix('h') {
        (n, 60 * 60 * 1000)
    } else {
        (input, 1000)
    };

    let num: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;
    num.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}
