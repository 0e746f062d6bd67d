//! One master and its slaves.
//!
//! A group probes its master, keeps the slave list in step with what the
//! master reports, and on a confirmed outage elects and promotes a slave.
//! All of it runs under one lock so a check never interleaves with a
//! failover of the same group.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::GroupError;
use crate::node::{split_host_port, Node, NodeOptions};
use crate::role::{Role, SlaveInfo};

/// What a failover did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The master answered the confirming ping. Nothing changed.
    FalseAlarm,
    Promoted(Promotion),
}

/// A completed topology switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub old_master: String,
    pub new_master: String,
    /// Former slaves that refused to follow the new master.
    pub unreconfigured: Vec<String>,
}

#[derive(Debug)]
struct Topology {
    master: Node,
    // never contains the master's address
    slaves: BTreeMap<String, Node>,
}

#[derive(Debug)]
pub struct Group {
    topology: Mutex<Topology>,
    options: NodeOptions,
}

impl Group {
    pub fn new(master: impl Into<String>, options: NodeOptions) -> Self {
        Self {
            topology: Mutex::new(Topology {
                master: Node::new(master, options.clone()),
                slaves: BTreeMap::new(),
            }),
            options,
        }
    }

    pub async fn master_addr(&self) -> String {
        self.topology.lock().await.master.addr().to_string()
    }

    pub async fn slave_addrs(&self) -> Vec<String> {
        self.topology.lock().await.slaves.keys().cloned().collect()
    }

    /// Probes the master and refreshes the slave list from its report.
    pub async fn check(&self) -> Result<(), GroupError> {
        let mut topo = self.topology.lock().await;
        let addr = topo.master.addr().to_string();

        let role = topo
            .master
            .role()
            .await
            .map_err(|source| GroupError::NodeDown {
                addr: addr.clone(),
                source,
            })?;

        match role {
            Role::Master { slaves, .. } => {
                topo.reconcile(slaves, &self.options);
                Ok(())
            }
            other => Err(GroupError::WrongRole {
                addr,
                role: other.name().to_string(),
            }),
        }
    }

    /// Replaces a master that failed its check.
    ///
    /// The master gets one more ping first; if it answers the failover is
    /// abandoned. Otherwise the best slave is promoted and the rest are
    /// pointed at it.
    pub async fn failover(&self) -> Result<FailoverOutcome, GroupError> {
        let mut topo = self.topology.lock().await;
        let old_master = topo.master.addr().to_string();

        if topo.master.ping().await.is_ok() {
            warn!(master = %old_master, "master answered ping, not failing over");
            return Ok(FailoverOutcome::FalseAlarm);
        }

        let candidate = topo.elect().await?;
        info!(master = %old_master, candidate = %candidate, "elected slave for promotion");

        let unreconfigured = topo.promote(&candidate).await?;
        Ok(FailoverOutcome::Promoted(Promotion {
            old_master,
            new_master: candidate,
            unreconfigured,
        }))
    }

    /// Closes every connection the group holds.
    pub async fn close(&self) {
        let mut topo = self.topology.lock().await;
        topo.master.close();
        for node in topo.slaves.values_mut() {
            node.close();
        }
    }
}

impl Topology {
    /// Makes the slave map exactly what the master just reported.
    fn reconcile(&mut self, reported: Vec<SlaveInfo>, options: &NodeOptions) {
        let master = self.master.addr().to_string();
        let mut next = BTreeMap::new();

        for info in reported {
            if info.addr == master || next.contains_key(&info.addr) {
                continue;
            }
            let mut node = match self.slaves.remove(&info.addr) {
                Some(node) => node,
                None => {
                    info!(master = %master, slave = %info.addr, "slave added");
                    Node::new(info.addr.clone(), options.clone())
                }
            };
            node.set_offset(info.offset);
            next.insert(info.addr, node);
        }

        for (addr, mut node) in std::mem::replace(&mut self.slaves, next) {
            info!(master = %master, slave = %addr, "slave removed");
            node.close();
        }
    }

    /// Picks the slave with the greatest offset its master last reported.
    ///
    /// Slaves that can't be probed or aren't slaves are skipped. A slave
    /// whose link to the master is still up aborts the election. Ties go
    /// to the slave evaluated last.
    async fn elect(&mut self) -> Result<String, GroupError> {
        let mut best: Option<(&str, i64)> = None;

        for (addr, node) in self.slaves.iter_mut() {
            let role = match node.role().await {
                Ok(role) => role,
                Err(e) => {
                    warn!(slave = %addr, "skipping slave, role probe failed: {e}");
                    continue;
                }
            };
            let state = match role {
                Role::Slave { state, .. } => state,
                other => {
                    warn!(slave = %addr, role = other.name(), "skipping node, not a slave");
                    continue;
                }
            };
            if state.is_live() {
                return Err(GroupError::NodeAlive {
                    addr: addr.clone(),
                    state: state.to_string(),
                });
            }
            let offset = node.offset();
            if best.map_or(true, |(_, top)| offset >= top) {
                best = Some((addr.as_str(), offset));
            }
        }

        best.map(|(addr, _)| addr.to_string())
            .ok_or(GroupError::NoCandidate)
    }

    /// Detaches `candidate`, installs it as master, and repoints the rest.
    ///
    /// Returns the slaves that could not be repointed. Those are not
    /// retried and the switch is not rolled back.
    async fn promote(&mut self, candidate: &str) -> Result<Vec<String>, GroupError> {
        let (host, port) = split_host_port(candidate).map_err(|source| GroupError::Promote {
            addr: candidate.to_string(),
            source,
        })?;
        let mut node = self
            .slaves
            .remove(candidate)
            .ok_or(GroupError::NoCandidate)?;

        if let Err(source) = node.slave_of(None).await {
            self.slaves.insert(candidate.to_string(), node);
            return Err(GroupError::Promote {
                addr: candidate.to_string(),
                source,
            });
        }

        let old = std::mem::replace(&mut self.master, node);
        info!(old = %old.addr(), new = %candidate, "promoted slave to master");

        let mut unreconfigured = Vec::new();
        for (addr, slave) in self.slaves.iter_mut() {
            if let Err(e) = slave.slave_of(Some((host, port))).await {
                error!(
                    slave = %addr,
                    master = %candidate,
                    "slave did not follow new master, topology needs operator attention: {e}"
                );
                unreconfigured.push(addr.clone());
            }
        }
        Ok(unreconfigured)
    }
}
