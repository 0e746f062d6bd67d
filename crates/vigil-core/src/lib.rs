//! vigil-core: the failover engine.
//!
//! - [`node`]: bounded-retry client for one store node (ROLE, PING, SLAVEOF)
//! - [`group`]: health check, election, and promotion for one master
//! - [`masters`]: the replicated set of monitored masters
//! - [`coordinator`]: the consensus seam (leadership, proposals, membership)
//! - [`supervisor`]: the periodic tick that ties it together
//!
//! Nothing here knows how consensus is implemented; `vigil-cluster`
//! provides the raft-backed [`Coordinator`].

mod connection;
pub mod coordinator;
pub mod error;
pub mod group;
pub mod masters;
pub mod node;
pub mod role;
pub mod supervisor;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testing;

pub use coordinator::{parse_peers, Coordinator, Peer};
pub use error::{CoordinatorError, GroupError, MastersError, NodeError, PeerError};
pub use group::{FailoverOutcome, Group, Promotion};
pub use masters::{MasterCommand, MasterResponse, MasterSet, MasterState};
pub use node::{Node, NodeOptions};
pub use role::{LinkState, Role, SlaveInfo};
pub use supervisor::{FailoverHandler, HandlerError, Supervisor, SupervisorConfig};
