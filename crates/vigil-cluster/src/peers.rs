//! Startup membership resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_core::Peer;

use crate::error::ClusterError;

/// How configured peers combine with membership persisted by a prior run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Discard prior membership and start from the configured peers.
    New,
    /// Keep prior membership and add configured peers to it.
    #[default]
    Existing,
}

impl FromStr for ClusterState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(ClusterState::New),
            "existing" => Ok(ClusterState::Existing),
            other => Err(format!("unknown cluster state '{other}' (expected new or existing)")),
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::New => f.write_str("new"),
            ClusterState::Existing => f.write_str("existing"),
        }
    }
}

/// Checks configured peers for duplicate ids and addresses.
pub fn validate_peers(peers: &[Peer]) -> Result<(), ClusterError> {
    let mut ids = BTreeMap::new();
    for peer in peers {
        if let Some(prev) = ids.insert(peer.id, &peer.addr) {
            return Err(ClusterError::Config(format!(
                "peer id {} given twice ({prev} and {})",
                peer.id, peer.addr
            )));
        }
    }
    let mut addrs = BTreeMap::new();
    for peer in peers {
        if let Some(prev) = addrs.insert(&peer.addr, peer.id) {
            return Err(ClusterError::Config(format!(
                "address {} shared by peers {prev} and {}",
                peer.addr, peer.id
            )));
        }
    }
    Ok(())
}

/// Computes the starting membership.
///
/// With [`ClusterState::New`] only the configured peers count. With
/// [`ClusterState::Existing`] persisted members are kept and configured
/// peers are added; a configured address wins over a persisted one.
pub fn resolve_peers(
    state: ClusterState,
    configured: &[Peer],
    persisted: BTreeMap<u64, String>,
) -> Result<BTreeMap<u64, String>, ClusterError> {
    validate_peers(configured)?;

    let mut resolved = match state {
        ClusterState::New => BTreeMap::new(),
        ClusterState::Existing => persisted,
    };
    for peer in configured {
        if let Some(prev) = resolved.insert(peer.id, peer.addr.clone()) {
            if prev != peer.addr {
                warn!(id = peer.id, old = %prev, new = %peer.addr, "peer address changed");
            }
        }
    }
    Ok(resolved)
}
