//! Process lifecycle: wires the coordinator, supervisor, and control
//! plane together and tears them down in order on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use vigil_cluster::RaftCoordinator;
use vigil_core::{Coordinator, MasterSet, MasterState, Supervisor};

use crate::config::{MastersState, Settings};
use crate::http::{self, ControlPlane};
use crate::metrics;

/// How long a clustered instance waits to become leader before leaving
/// the initial masters to whoever is.
const SEED_WAIT: Duration = Duration::from_secs(10);

/// Runs the server until a shutdown signal arrives.
///
/// Shutdown stops the control plane, lets an in-flight tick finish,
/// closes group connections, then stops consensus and flushes its storage.
pub async fn run(
    settings: Settings,
    metrics_handle: Option<PrometheusHandle>,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&settings.data_dir).map_err(|e| {
        format!(
            "failed to create data dir '{}': {e}",
            settings.data_dir.display()
        )
    })?;

    let listener = TcpListener::bind(settings.addr)
        .await
        .map_err(|e| format!("failed to bind control plane on {}: {e}", settings.addr))?;
    let metrics_listener = match (settings.metrics_addr, &metrics_handle) {
        (Some(addr), Some(_)) => Some(
            TcpListener::bind(addr)
                .await
                .map_err(|e| format!("failed to bind metrics listener on {addr}: {e}"))?,
        ),
        _ => None,
    };

    let state = MasterState::new();
    let coordinator: Option<Arc<dyn Coordinator>> = match settings.raft.clone() {
        Some(raft) => {
            info!(
                id = raft.id,
                peers = raft.peers.len(),
                state = %raft.state,
                "starting raft coordinator"
            );
            let coordinator = RaftCoordinator::start(raft, state.clone()).await?;
            Some(Arc::new(coordinator))
        }
        None => {
            info!("no cluster peers configured, running standalone");
            None
        }
    };

    let masters = MasterSet::new(state, coordinator.clone());
    let supervisor = Arc::new(Supervisor::new(masters.clone(), settings.supervisor.clone()));
    metrics::count_failovers(&supervisor);

    let seed = if coordinator.is_some() {
        Some(tokio::spawn(seed_masters(
            masters.clone(),
            settings.masters.clone(),
            settings.masters_state,
        )))
    } else {
        seed_masters(masters.clone(), settings.masters.clone(), settings.masters_state).await;
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let plane = Arc::new(ControlPlane::new(masters, metrics_handle.clone()));
    let control = tokio::spawn(http::serve(listener, plane, shutdown_rx.clone()));
    let ticks = tokio::spawn(Arc::clone(&supervisor).run(shutdown_rx.clone()));

    let mut metrics_server = None;
    let mut poller = None;
    if let Some(handle) = metrics_handle {
        poller = Some(metrics::spawn_stats_poller(
            Arc::clone(&supervisor),
            handle.clone(),
        ));
        if let Some(listener) = metrics_listener {
            metrics_server = Some(tokio::spawn(metrics::serve(
                listener,
                handle,
                shutdown_rx.clone(),
            )));
        }
    }

    info!(
        addr = %settings.addr,
        check_interval = ?settings.supervisor.check_interval,
        "vigil started"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = control.await {
        warn!("control plane task failed: {e}");
    }
    if let Err(e) = ticks.await {
        warn!("supervisor task failed: {e}");
    }
    if let Some(task) = metrics_server {
        let _ = task.await;
    }
    for task in [seed, poller].into_iter().flatten() {
        task.abort();
    }
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Applies the configured masters.
///
/// With a coordinator this only happens on the leader; a follower gives
/// up after [`SEED_WAIT`].
async fn seed_masters(masters: MasterSet, initial: Vec<String>, mode: MastersState) {
    if initial.is_empty() && mode == MastersState::Existing {
        return;
    }

    if let Some(coordinator) = masters.coordinator() {
        let deadline = Instant::now() + SEED_WAIT;
        while !coordinator.is_leader() {
            if Instant::now() >= deadline {
                info!("not leader, leaving initial masters to the leader");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let result = match mode {
        MastersState::New => masters.replace(&initial).await,
        MastersState::Existing => masters.add(&initial).await,
    };
    match result {
        Ok(()) => info!(masters = ?initial, mode = %mode, "applied initial masters"),
        Err(e) => warn!("failed to apply initial masters: {e}"),
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
