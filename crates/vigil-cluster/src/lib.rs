//! vigil-cluster: raft consensus for the master set.
//!
//! Every vigil instance in a cluster runs a [`RaftCoordinator`]. Master-set
//! mutations are proposed to the raft leader, replicated, and applied to
//! each instance's [`vigil_core::MasterState`] in log order. Only the
//! leader supervises masters.
//!
//! Raft state is durable under `<data_dir>/raft/` (see [`store`]), and
//! RPCs travel as length-prefixed bincode frames over TCP.

pub mod coordinator;
pub mod disk;
pub mod error;
pub mod peers;
mod raft;
mod raft_transport;
pub mod store;

pub use coordinator::{RaftConfig, RaftCoordinator};
pub use disk::StoreError;
pub use error::ClusterError;
pub use peers::{resolve_peers, ClusterState};
pub use raft::TypeConfig;
pub use store::Storage;
