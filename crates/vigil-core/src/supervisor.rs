//! The process-wide failover scheduler.
//!
//! Every tick, while this instance is leader, the supervisor makes sure
//! there is one [`Group`] per monitored master, checks them all in
//! parallel, and drives failover for the ones that are down. Ticks never
//! overlap: the next one starts after every group task of the current one
//! has finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::GroupError;
use crate::group::{FailoverOutcome, Group, Promotion};
use crate::masters::MasterSet;
use crate::node::NodeOptions;

/// Error a failover callback may return. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Called with `(old_master, new_master)` after every promotion.
pub type FailoverHandler = Box<dyn Fn(&str, &str) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    /// Start monitoring the promoted slave once a failover completes.
    pub follow_promoted: bool,
    pub node: NodeOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            follow_promoted: true,
            node: NodeOptions::default(),
        }
    }
}

pub struct Supervisor {
    masters: MasterSet,
    config: SupervisorConfig,
    groups: Mutex<HashMap<String, Arc<Group>>>,
    handlers: Mutex<Vec<FailoverHandler>>,
}

impl Supervisor {
    pub fn new(masters: MasterSet, config: SupervisorConfig) -> Self {
        Self {
            masters,
            config,
            groups: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn masters(&self) -> &MasterSet {
        &self.masters
    }

    /// Registers a callback for completed failovers.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Without a coordinator the local instance is always leader.
    pub fn is_leader(&self) -> bool {
        self.masters
            .coordinator()
            .map_or(true, |coordinator| coordinator.is_leader())
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The group for `master`, if one exists.
    pub fn group(&self, master: &str) -> Option<Arc<Group>> {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(master)
            .cloned()
    }

    /// Runs one check cycle. Returns how many groups were checked.
    pub async fn tick(self: &Arc<Self>) -> usize {
        if !self.is_leader() {
            debug!("not leader, skipping check cycle");
            return 0;
        }

        let started = Instant::now();
        let (groups, retired) = self.sync_groups();
        for group in retired {
            group.close().await;
        }

        let checked = groups.len();
        let mut tasks = JoinSet::new();
        for group in groups {
            let this = Arc::clone(self);
            tasks.spawn(async move { this.check_master(group).await });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("group check task failed: {e}");
            }
        }

        debug!(groups = checked, elapsed = ?started.elapsed(), "check cycle done");
        checked
    }

    /// Drives ticks until `shutdown` flips or its sender goes away.
    ///
    /// A tick in progress is allowed to finish. Groups are closed on exit.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("supervisor stopped");
        self.close().await;
    }

    /// Closes every group's connections and forgets them.
    pub async fn close(&self) {
        let groups: Vec<_> = self
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, g)| g)
            .collect();
        for group in groups {
            group.close().await;
        }
    }

    /// Creates groups for new masters and retires groups for masters no
    /// longer in the set. Returns (current, retired).
    fn sync_groups(&self) -> (Vec<Arc<Group>>, Vec<Arc<Group>>) {
        let current = self.masters.current();
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());

        let stale: Vec<String> = groups
            .keys()
            .filter(|addr| !current.contains(*addr))
            .cloned()
            .collect();
        let retired = stale
            .iter()
            .filter_map(|addr| groups.remove(addr))
            .collect();

        let active = current
            .into_iter()
            .map(|addr| {
                let group = groups.entry(addr).or_insert_with_key(|addr| {
                    info!(master = %addr, "monitoring master");
                    Arc::new(Group::new(addr.clone(), self.config.node.clone()))
                });
                Arc::clone(group)
            })
            .collect();

        (active, retired)
    }

    async fn check_master(&self, group: Arc<Group>) {
        let err = match group.check().await {
            Ok(()) => return,
            Err(e) => e,
        };
        let addr = match &err {
            GroupError::NodeDown { addr, .. } | GroupError::WrongRole { addr, .. } => addr.clone(),
            _ => {
                error!("unexpected check result: {err}");
                return;
            }
        };

        // stop scheduling this master whatever the failover does
        if let Err(e) = self.masters.remove(&[addr.as_str()]).await {
            error!(master = %addr, "failed to remove master from set: {e}");
        }

        if let GroupError::WrongRole { .. } = err {
            warn!(master = %addr, "{err}, no longer monitoring it");
            return;
        }

        error!(master = %addr, "{err}, starting failover");
        match group.failover().await {
            Ok(FailoverOutcome::FalseAlarm) => {
                if let Err(e) = self.masters.add(&[addr.as_str()]).await {
                    error!(master = %addr, "failed to restore master after false alarm: {e}");
                }
            }
            Ok(FailoverOutcome::Promoted(promotion)) => self.on_promoted(&promotion).await,
            Err(e) => error!(master = %addr, "failover failed: {e}"),
        }
    }

    async fn on_promoted(&self, promotion: &Promotion) {
        let Promotion {
            old_master,
            new_master,
            unreconfigured,
        } = promotion;
        info!(
            old = %old_master,
            new = %new_master,
            unreconfigured = unreconfigured.len(),
            "failover complete"
        );

        if self.config.follow_promoted {
            if let Err(e) = self.masters.add(&[new_master.as_str()]).await {
                error!(master = %new_master, "failed to add promoted master to set: {e}");
            }
        }

        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            if let Err(e) = handler(old_master, new_master) {
                warn!(old = %old_master, new = %new_master, "failover handler failed: {e}");
            }
        }
    }
}
