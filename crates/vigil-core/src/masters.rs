//! The replicated set of monitored masters.
//!
//! [`MasterState`] is the applied value: every instance feeds it the same
//! ordered [`MasterCommand`]s and ends up with the same set. [`MasterSet`]
//! is what callers mutate; it routes changes through the coordinator when
//! there is one and applies them in-process when there isn't.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::coordinator::Coordinator;
use crate::error::MastersError;
use crate::node::split_host_port;

/// A mutation of the master set. One command is one log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterCommand {
    Replace(Vec<String>),
    Add(Vec<String>),
    Remove(Vec<String>),
}

/// Result of applying a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterResponse {
    /// Size of the set after the command.
    pub masters: usize,
}

/// The applied master set. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MasterState {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one command. Adding a present address or removing an
    /// absent one changes nothing.
    pub fn apply(&self, cmd: &MasterCommand) -> MasterResponse {
        let mut set = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match cmd {
            MasterCommand::Replace(addrs) => {
                set.clear();
                set.extend(addrs.iter().cloned());
            }
            MasterCommand::Add(addrs) => set.extend(addrs.iter().cloned()),
            MasterCommand::Remove(addrs) => {
                for addr in addrs {
                    set.remove(addr);
                }
            }
        }
        MasterResponse { masters: set.len() }
    }

    /// Sorted list of monitored masters.
    pub fn current(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.read().contains(addr)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.read().clone()
    }

    /// Replaces the whole state, e.g. from a consensus snapshot.
    pub fn restore(&self, set: BTreeSet<String>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = set;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mutating facade over the master set.
#[derive(Clone)]
pub struct MasterSet {
    state: MasterState,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl MasterSet {
    pub fn new(state: MasterState, coordinator: Option<Arc<dyn Coordinator>>) -> Self {
        Self { state, coordinator }
    }

    /// A set with no consensus behind it; mutations apply immediately.
    pub fn local() -> Self {
        Self::new(MasterState::new(), None)
    }

    pub fn state(&self) -> &MasterState {
        &self.state
    }

    pub fn coordinator(&self) -> Option<&Arc<dyn Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Local read of the applied set. No consensus round-trip.
    pub fn current(&self) -> Vec<String> {
        self.state.current()
    }

    pub async fn add<S: AsRef<str>>(&self, addrs: &[S]) -> Result<(), MastersError> {
        let addrs = normalize(addrs)?;
        self.submit(MasterCommand::Add(addrs)).await
    }

    pub async fn remove<S: AsRef<str>>(&self, addrs: &[S]) -> Result<(), MastersError> {
        let addrs = normalize(addrs)?;
        self.submit(MasterCommand::Remove(addrs)).await
    }

    pub async fn replace<S: AsRef<str>>(&self, addrs: &[S]) -> Result<(), MastersError> {
        let addrs = normalize(addrs)?;
        self.submit(MasterCommand::Replace(addrs)).await
    }

    async fn submit(&self, cmd: MasterCommand) -> Result<(), MastersError> {
        match &self.coordinator {
            Some(coordinator) => {
                coordinator.propose(cmd).await?;
            }
            None => {
                self.state.apply(&cmd);
            }
        }
        Ok(())
    }
}

/// Trims addresses, drops blanks, and rejects anything that isn't
/// `host:port`. All or nothing.
pub fn normalize<S: AsRef<str>>(addrs: &[S]) -> Result<Vec<String>, MastersError> {
    let mut out = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let addr = addr.as_ref().trim();
        if addr.is_empty() {
            continue;
        }
        split_host_port(addr).map_err(|_| MastersError::InvalidAddress(addr.to_string()))?;
        out.push(addr.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use crate::testing::MockCoordinator;

    fn strings(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn same_commands_same_state() {
        let ops = vec![
            MasterCommand::Add(strings(&["a:1", "b:2"])),
            MasterCommand::Remove(strings(&["a:1"])),
            MasterCommand::Add(strings(&["c:3", "a:1"])),
            MasterCommand::Replace(strings(&["d:4", "c:3"])),
            MasterCommand::Remove(strings(&["zz:9"])),
            MasterCommand::Add(strings(&["e:5"])),
        ];

        let left = MasterState::new();
        let right = MasterState::new();
        for op in &ops {
            left.apply(op);
        }
        for op in &ops {
            right.apply(op);
        }

        assert_eq!(left.snapshot(), right.snapshot());
        assert_eq!(left.current(), strings(&["c:3", "d:4", "e:5"]));
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let state = MasterState::new();
        state.apply(&MasterCommand::Add(strings(&["a:1", "b:2"])));
        let before = state.snapshot();

        let resp = state.apply(&MasterCommand::Add(strings(&["a:1"])));
        assert_eq!(resp.masters, 2);
        assert_eq!(state.snapshot(), before);

        state.apply(&MasterCommand::Remove(strings(&["nope:1"])));
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn restore_replaces_everything() {
        let state = MasterState::new();
        state.apply(&MasterCommand::Add(strings(&["a:1"])));
        state.restore(["x:1".to_string()].into_iter().collect());
        assert_eq!(state.current(), strings(&["x:1"]));
        assert!(!state.contains("a:1"));
    }

    #[test]
    fn normalize_trims_and_validates() {
        assert_eq!(
            normalize(&[" a:1", "", "b:2 "]).unwrap(),
            strings(&["a:1", "b:2"])
        );
        assert!(matches!(
            normalize(&["a:1", "no-port"]),
            Err(MastersError::InvalidAddress(addr)) if addr == "no-port"
        ));
    }

    #[tokio::test]
    async fn local_set_applies_immediately() {
        let set = MasterSet::local();
        set.add(&["127.0.0.1:6379", "127.0.0.1:6380"]).await.unwrap();
        set.remove(&["127.0.0.1:6379"]).await.unwrap();
        assert_eq!(set.current(), strings(&["127.0.0.1:6380"]));

        set.replace(&["10.0.0.1:6379"]).await.unwrap();
        assert_eq!(set.current(), strings(&["10.0.0.1:6379"]));
    }

    #[tokio::test]
    async fn invalid_address_changes_nothing() {
        let set = MasterSet::local();
        set.add(&["127.0.0.1:6379"]).await.unwrap();
        assert!(set.replace(&["10.0.0.1:6379", "bogus"]).await.is_err());
        assert_eq!(set.current(), strings(&["127.0.0.1:6379"]));
    }

    #[tokio::test]
    async fn mutations_go_through_coordinator() {
        let state = MasterState::new();
        let coordinator = Arc::new(MockCoordinator::new(state.clone()));
        let set = MasterSet::new(state, Some(coordinator.clone()));

        set.add(&["127.0.0.1:6379"]).await.unwrap();
        assert_eq!(set.current(), strings(&["127.0.0.1:6379"]));
        assert_eq!(
            coordinator.proposals(),
            vec![MasterCommand::Add(strings(&["127.0.0.1:6379"]))]
        );
    }

    #[tokio::test]
    async fn rejected_proposal_leaves_state_alone() {
        let state = MasterState::new();
        let coordinator = Arc::new(MockCoordinator::new(state.clone()));
        coordinator.set_leader(false);
        let set = MasterSet::new(state, Some(coordinator.clone()));

        let err = set.add(&["127.0.0.1:6379"]).await.unwrap_err();
        assert!(matches!(
            err,
            MastersError::Coordinator(CoordinatorError::NotLeader { .. })
        ));
        assert!(set.current().is_empty());
        assert!(coordinator.proposals().is_empty());
    }
}
