//! The consensus seam.
//!
//! The supervisor and the master set only need to know whether this
//! instance may act and how to get a mutation committed. Everything else
//! about the consensus protocol stays behind [`Coordinator`], so tests can
//! swap in an in-memory implementation.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, PeerError};
use crate::masters::{MasterCommand, MasterResponse};
use crate::node::split_host_port;

/// A member of the consensus cluster, written as `ID:host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    /// Address of the peer's raft listener.
    pub addr: String,
}

impl Peer {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

impl FromStr for Peer {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PeerError(s.to_string());
        let (id, addr) = s.split_once(':').ok_or_else(invalid)?;
        let id = id.parse().map_err(|_| invalid())?;
        split_host_port(addr).map_err(|_| invalid())?;
        Ok(Peer::new(id, addr))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.addr)
    }
}

/// Parses a list of `ID:host:port` entries, skipping blanks.
pub fn parse_peers<I, S>(entries: I) -> Result<Vec<Peer>, PeerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter(|e| !e.as_ref().trim().is_empty())
        .map(|e| e.as_ref().parse())
        .collect()
}

/// Leadership and replicated mutation of the master set.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Whether this instance currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Commits a master-set mutation through consensus.
    ///
    /// Returns once the command is applied locally. On error nothing was
    /// applied.
    async fn propose(&self, cmd: MasterCommand) -> Result<MasterResponse, CoordinatorError>;

    /// Current cluster membership.
    async fn peers(&self) -> Result<Vec<Peer>, CoordinatorError>;

    async fn add_peer(&self, peer: Peer) -> Result<(), CoordinatorError>;

    async fn remove_peer(&self, peer: Peer) -> Result<(), CoordinatorError>;

    /// Replaces the membership wholesale.
    async fn set_peers(&self, peers: Vec<Peer>) -> Result<(), CoordinatorError>;

    /// Stops consensus participation and flushes local state.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer() {
        let peer: Peer = "1:127.0.0.1:12000".parse().unwrap();
        assert_eq!(peer, Peer::new(1, "127.0.0.1:12000"));
        assert_eq!(peer.to_string(), "1:127.0.0.1:12000");
    }

    #[test]
    fn malformed_peers_rejected() {
        for bad in ["127.0.0.1:12000", "x:127.0.0.1:12000", "1:127.0.0.1", "1:", ""] {
            assert!(bad.parse::<Peer>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn parse_peer_list_skips_blanks() {
        let peers = parse_peers(["1:a:1", " ", "2:b:2 "]).unwrap();
        assert_eq!(peers, vec![Peer::new(1, "a:1"), Peer::new(2, "b:2")]);

        let err = parse_peers(["1:a:1", "oops"]).unwrap_err();
        assert_eq!(err, PeerError("oops".into()));
    }
}
