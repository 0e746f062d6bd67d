//! In-memory coordinator for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::coordinator::{Coordinator, Peer};
use crate::error::CoordinatorError;
use crate::masters::{MasterCommand, MasterResponse, MasterState};

/// Commits proposals straight into a [`MasterState`] while "leader".
///
/// Leadership is flipped by hand with [`set_leader`](Self::set_leader).
#[derive(Debug)]
pub struct MockCoordinator {
    leader: AtomicBool,
    state: MasterState,
    peers: Mutex<BTreeMap<u64, String>>,
    proposals: Mutex<Vec<MasterCommand>>,
}

impl MockCoordinator {
    /// Starts as leader.
    pub fn new(state: MasterState) -> Self {
        Self {
            leader: AtomicBool::new(true),
            state,
            peers: Mutex::new(BTreeMap::new()),
            proposals: Mutex::new(Vec::new()),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Committed proposals, in order.
    pub fn proposals(&self) -> Vec<MasterCommand> {
        self.proposals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ensure_leader(&self) -> Result<(), CoordinatorError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(CoordinatorError::NotLeader { leader: None })
        }
    }

    fn peers_mut(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, String>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    async fn propose(&self, cmd: MasterCommand) -> Result<MasterResponse, CoordinatorError> {
        self.ensure_leader()?;
        let resp = self.state.apply(&cmd);
        self.proposals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd);
        Ok(resp)
    }

    async fn peers(&self) -> Result<Vec<Peer>, CoordinatorError> {
        Ok(self
            .peers_mut()
            .iter()
            .map(|(id, addr)| Peer::new(*id, addr.clone()))
            .collect())
    }

    async fn add_peer(&self, peer: Peer) -> Result<(), CoordinatorError> {
        self.ensure_leader()?;
        self.peers_mut().insert(peer.id, peer.addr);
        Ok(())
    }

    async fn remove_peer(&self, peer: Peer) -> Result<(), CoordinatorError> {
        self.ensure_leader()?;
        self.peers_mut().remove(&peer.id);
        Ok(())
    }

    async fn set_peers(&self, peers: Vec<Peer>) -> Result<(), CoordinatorError> {
        self.ensure_leader()?;
        let mut current = self.peers_mut();
        current.clear();
        current.extend(peers.into_iter().map(|p| (p.id, p.addr)));
        Ok(())
    }

    async fn shutdown(&self) {}
}
