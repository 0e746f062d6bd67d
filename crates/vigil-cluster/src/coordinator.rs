//! Raft-backed [`Coordinator`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Config, Raft, ServerState, SnapshotPolicy};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::{Coordinator, CoordinatorError, MasterCommand, MasterResponse, MasterState, Peer};

use crate::error::ClusterError;
use crate::peers::{resolve_peers, validate_peers, ClusterState};
use crate::raft::{spawn_raft_listener, RaftNetworkFactory, TypeConfig};
use crate::store::Storage;

/// Settings for one raft participant.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This instance's raft node id. Must appear in `peers`.
    pub id: u64,
    /// Raft state is kept under `<data_dir>/raft`.
    pub data_dir: PathBuf,
    pub peers: Vec<Peer>,
    pub state: ClusterState,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Applied logs between snapshots.
    pub snapshot_threshold: u64,
}

impl RaftConfig {
    pub fn new(id: u64, data_dir: impl Into<PathBuf>, peers: Vec<Peer>) -> Self {
        Self {
            id,
            data_dir: data_dir.into(),
            peers,
            state: ClusterState::default(),
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            snapshot_threshold: 1024,
        }
    }

    fn openraft_config(&self) -> Result<Config, ClusterError> {
        Config {
            cluster_name: "vigil".to_string(),
            heartbeat_interval: millis(self.heartbeat_interval),
            election_timeout_min: millis(self.election_timeout_min),
            election_timeout_max: millis(self.election_timeout_max),
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Config::default()
        }
        .validate()
        .map_err(|e| ClusterError::Config(e.to_string()))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A running raft participant replicating the master set.
pub struct RaftCoordinator {
    id: u64,
    addr: String,
    raft: Raft<TypeConfig>,
    storage: Arc<Storage>,
    listener: Mutex<Option<JoinHandle<()>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RaftCoordinator {
    /// Opens storage, starts raft, and begins serving raft RPCs.
    ///
    /// Committed master-set changes are applied to `masters`. A node with
    /// no history bootstraps the cluster from the resolved membership.
    pub async fn start(config: RaftConfig, masters: MasterState) -> Result<Self, ClusterError> {
        validate_peers(&config.peers)?;
        let addr = config
            .peers
            .iter()
            .find(|p| p.id == config.id)
            .map(|p| p.addr.clone())
            .ok_or_else(|| {
                ClusterError::Config(format!(
                    "server id {} is not in the cluster peer list",
                    config.id
                ))
            })?;
        let raft_config = Arc::new(config.openraft_config()?);

        let raft_dir = config.data_dir.join("raft");
        if config.state == ClusterState::New && raft_dir.exists() {
            warn!(dir = %raft_dir.display(), "cluster state is new, discarding prior raft state");
            Storage::wipe(&raft_dir)?;
        }

        let storage = Storage::open(&raft_dir, masters)?;
        let fresh = !storage.has_history().await;
        let members = resolve_peers(config.state, &config.peers, storage.persisted_peers()?)?;
        storage.save_peers(&members)?;

        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| ClusterError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let (log_store, state_machine) = Adaptor::new(Arc::clone(&storage));
        let raft = Raft::new(
            config.id,
            raft_config,
            RaftNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Raft(e.to_string()))?;

        let listener = spawn_raft_listener(raft.clone(), listener);

        let mut reconciler = None;
        if fresh {
            let nodes: BTreeMap<u64, BasicNode> = if members.len() <= 1 {
                info!(id = config.id, "running single-node raft");
                BTreeMap::from([(config.id, BasicNode::new(&addr))])
            } else {
                members
                    .iter()
                    .map(|(id, addr)| (*id, BasicNode::new(addr)))
                    .collect()
            };
            let count = nodes.len();
            match raft.initialize(nodes).await {
                Ok(()) => info!(members = count, "initialized raft cluster"),
                Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                    debug!("raft already initialized: {e}");
                }
                Err(e) => {
                    listener.abort();
                    let _ = raft.shutdown().await;
                    return Err(ClusterError::Raft(e.to_string()));
                }
            }
        } else if members.len() > 1 {
            reconciler = Some(tokio::spawn(reconcile_membership(raft.clone(), members)));
        }

        info!(id = config.id, %addr, state = %config.state, "raft coordinator started");

        Ok(Self {
            id: config.id,
            addr,
            raft,
            storage,
            listener: Mutex::new(Some(listener)),
            reconciler: Mutex::new(reconciler),
            stopped: AtomicBool::new(false),
        })
    }

    /// Address of this instance's raft listener.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Raft address of the current leader, if one is known.
    pub fn leader(&self) -> Option<String> {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        let leader = m.current_leader?;
        m.membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
    }

    fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
        slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl Coordinator for RaftCoordinator {
    fn is_leader(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self.raft.metrics().borrow().state == ServerState::Leader
    }

    async fn propose(&self, cmd: MasterCommand) -> Result<MasterResponse, CoordinatorError> {
        self.raft
            .client_write(cmd)
            .await
            .map(|resp| resp.data)
            .map_err(write_error)
    }

    async fn peers(&self) -> Result<Vec<Peer>, CoordinatorError> {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        Ok(m.membership_config
            .membership()
            .nodes()
            .map(|(id, node)| Peer::new(*id, node.addr.clone()))
            .collect())
    }

    async fn add_peer(&self, peer: Peer) -> Result<(), CoordinatorError> {
        info!(%peer, "adding raft peer");
        add_voter(&self.raft, peer.id, peer.addr).await
    }

    async fn remove_peer(&self, peer: Peer) -> Result<(), CoordinatorError> {
        info!(%peer, "removing raft peer");
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([peer.id])), false)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn set_peers(&self, peers: Vec<Peer>) -> Result<(), CoordinatorError> {
        if peers.is_empty() {
            return Err(CoordinatorError::Membership(
                "membership cannot be empty".into(),
            ));
        }
        validate_peers(&peers).map_err(|e| CoordinatorError::Membership(e.to_string()))?;

        let known: BTreeSet<u64> = {
            let metrics = self.raft.metrics();
            let m = metrics.borrow();
            m.membership_config
                .membership()
                .nodes()
                .map(|(id, _)| *id)
                .collect()
        };
        for peer in peers.iter().filter(|p| !known.contains(&p.id)) {
            self.raft
                .add_learner(peer.id, BasicNode::new(&peer.addr), true)
                .await
                .map_err(write_error)?;
        }

        let voters: BTreeSet<u64> = peers.iter().map(|p| p.id).collect();
        info!(voters = ?voters, "replacing raft membership");
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = Self::take_task(&self.reconciler) {
            task.abort();
        }
        if let Some(task) = Self::take_task(&self.listener) {
            task.abort();
        }
        if let Err(e) = self.raft.shutdown().await {
            warn!("raft shutdown: {e}");
        }
        if let Err(e) = self.storage.sync() {
            warn!("raft storage flush failed: {e}");
        }
        info!(id = self.id, "raft coordinator stopped");
    }
}

/// Adds `id` as a learner, waits for it to catch up, then makes it a voter.
async fn add_voter(raft: &Raft<TypeConfig>, id: u64, addr: String) -> Result<(), CoordinatorError> {
    raft.add_learner(id, BasicNode::new(addr), true)
        .await
        .map_err(write_error)?;
    raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
        .await
        .map_err(write_error)?;
    Ok(())
}

/// Brings configured peers into an existing membership once this node
/// leads. Exits when nothing is missing or raft stops.
async fn reconcile_membership(raft: Raft<TypeConfig>, members: BTreeMap<u64, String>) {
    let mut metrics = raft.metrics();
    loop {
        let (leader, missing) = {
            let m = metrics.borrow_and_update();
            let current = m.membership_config.membership();
            let missing: Vec<(u64, String)> = members
                .iter()
                .filter(|(id, _)| current.get_node(id).is_none())
                .map(|(id, addr)| (*id, addr.clone()))
                .collect();
            (m.state == ServerState::Leader, missing)
        };
        if missing.is_empty() {
            return;
        }

        if leader {
            for (id, addr) in missing {
                info!(id, %addr, "adding configured peer to membership");
                if let Err(e) = add_voter(&raft, id, addr).await {
                    warn!(id, "failed to add configured peer: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            continue;
        }

        if metrics.changed().await.is_err() {
            return;
        }
    }
}

fn write_error(e: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> CoordinatorError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => CoordinatorError::NotLeader {
            leader: fwd.leader_node.map(|n| n.addr),
        },
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            CoordinatorError::Membership(e.to_string())
        }
        other => CoordinatorError::Fatal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn fast(mut config: RaftConfig) -> RaftConfig {
        config.heartbeat_interval = Duration::from_millis(50);
        config.election_timeout_min = Duration::from_millis(300);
        config.election_timeout_max = Duration::from_millis(600);
        config
    }

    async fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn add(addr: &str) -> MasterCommand {
        MasterCommand::Add(vec![addr.to_string()])
    }

    #[tokio::test]
    async fn single_node_leads_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let masters = MasterState::new();
        let config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
        let node = RaftCoordinator::start(config, masters.clone()).await.unwrap();

        wait_until("leadership", || node.is_leader()).await;
        let resp = node.propose(add("10.0.0.1:6379")).await.unwrap();

        assert_eq!(resp.masters, 1);
        assert!(masters.contains("10.0.0.1:6379"));
        assert_eq!(node.peers().await.unwrap(), vec![Peer::new(1, node.addr())]);

        node.shutdown().await;
        assert!(!node.is_leader());
    }

    #[tokio::test]
    async fn restart_recovers_master_set() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
            let node = RaftCoordinator::start(config, MasterState::new()).await.unwrap();
            wait_until("leadership", || node.is_leader()).await;
            node.propose(add("10.0.0.1:6379")).await.unwrap();
            node.propose(add("10.0.0.2:6379")).await.unwrap();
            node.shutdown().await;
        }

        let masters = MasterState::new();
        let config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
        let node = RaftCoordinator::start(config, masters.clone()).await.unwrap();

        wait_until("replayed masters", || masters.len() == 2).await;
        assert_eq!(masters.current(), vec!["10.0.0.1:6379", "10.0.0.2:6379"]);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn new_state_discards_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
            let node = RaftCoordinator::start(config, MasterState::new()).await.unwrap();
            wait_until("leadership", || node.is_leader()).await;
            node.propose(add("10.0.0.1:6379")).await.unwrap();
            node.shutdown().await;
        }

        let masters = MasterState::new();
        let mut config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
        config.state = ClusterState::New;
        let node = RaftCoordinator::start(config, masters.clone()).await.unwrap();

        wait_until("leadership", || node.is_leader()).await;
        assert!(masters.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_server_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = RaftConfig::new(7, dir.path(), vec![Peer::new(1, free_addr())]);
        let err = RaftCoordinator::start(config, MasterState::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[tokio::test]
    async fn empty_membership_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast(RaftConfig::new(1, dir.path(), vec![Peer::new(1, free_addr())]));
        let node = RaftCoordinator::start(config, MasterState::new()).await.unwrap();
        wait_until("leadership", || node.is_leader()).await;

        let err = node.set_peers(Vec::new()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Membership(_)));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn three_nodes_replicate_and_redirect() {
        let peers: Vec<Peer> = (1..=3).map(|id| Peer::new(id, free_addr())).collect();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

        let mut nodes = Vec::new();
        let mut states = Vec::new();
        for (peer, dir) in peers.iter().zip(&dirs) {
            let masters = MasterState::new();
            let mut config = fast(RaftConfig::new(peer.id, dir.path(), peers.clone()));
            config.state = ClusterState::New;
            nodes.push(RaftCoordinator::start(config, masters.clone()).await.unwrap());
            states.push(masters);
        }

        wait_until("a leader", || nodes.iter().any(|n| n.is_leader())).await;
        let leader = nodes.iter().position(|n| n.is_leader()).unwrap();
        let follower = (leader + 1) % nodes.len();

        nodes[leader].propose(add("10.0.0.1:6379")).await.unwrap();
        wait_until("replication", || {
            states.iter().all(|s| s.contains("10.0.0.1:6379"))
        })
        .await;

        assert_eq!(nodes[follower].leader(), Some(peers[leader].addr.clone()));
        let err = nodes[follower].propose(add("10.0.0.2:6379")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotLeader { .. }));
        assert!(!states[follower].contains("10.0.0.2:6379"));

        let mut members = nodes[leader].peers().await.unwrap();
        members.sort();
        assert_eq!(members, peers);

        for node in &nodes {
            node.shutdown().await;
        }
    }
}
