//! Error types for the failover engine.

use std::time::Duration;

use thiserror::Error;
use vigil_protocol::ProtocolError;

/// Errors from talking to a single store node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("node disconnected")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered with an error reply. Not retried.
    #[error("node replied: {0}")]
    Reply(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("invalid node address {0:?}, expected host:port")]
    InvalidAddress(String),

    /// Every attempt of a logical operation failed.
    #[error("{addr} unreachable after {attempts} attempts: {last}")]
    Unreachable {
        addr: String,
        attempts: u32,
        #[source]
        last: Box<NodeError>,
    },
}

/// Classification returned by group checks and failovers.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("master {addr} is down: {source}")]
    NodeDown {
        addr: String,
        #[source]
        source: NodeError,
    },

    #[error("{addr} is no longer a master (role {role})")]
    WrongRole { addr: String, role: String },

    #[error("no slave eligible for promotion")]
    NoCandidate,

    #[error("slave {addr} replication link is {state}, master may still be alive")]
    NodeAlive { addr: String, state: String },

    #[error("failed to promote {addr}: {source}")]
    Promote {
        addr: String,
        #[source]
        source: NodeError,
    },
}

/// Errors from a coordinator operation.
///
/// A rejected proposal leaves local state untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("not leader{}", .leader.as_ref().map(|l| format!(", leader at {l}")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    #[error("membership change failed: {0}")]
    Membership(String),

    #[error("raft fatal: {0}")]
    Fatal(String),
}

/// Errors from mutating the master set.
#[derive(Debug, Error)]
pub enum MastersError {
    #[error("invalid master address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// A malformed `ID:host:port` peer entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid peer {0:?}, expected ID:host:port")]
pub struct PeerError(pub String);
