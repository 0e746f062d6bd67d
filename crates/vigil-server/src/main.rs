mod config;
mod http;
mod metrics;
mod server;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use vigil_cluster::ClusterState;

use crate::config::{MastersState, VigilConfig};

#[derive(Parser)]
#[command(name = "vigil-server", about = "redis master failover monitor")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// HTTP control plane address (host:port)
    #[arg(short, long, env = "VIGIL_ADDR")]
    addr: Option<String>,

    /// directory for raft state
    #[arg(long, env = "VIGIL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// this instance's raft id. must appear in --cluster
    #[arg(long, env = "VIGIL_SERVER_ID")]
    server_id: Option<u64>,

    /// raft peers as comma-separated ID:host:port entries, self included
    #[arg(long, env = "VIGIL_CLUSTER", value_delimiter = ',')]
    cluster: Option<Vec<String>>,

    /// new wipes local raft state and bootstraps; existing resumes it
    #[arg(long, env = "VIGIL_CLUSTER_STATE")]
    cluster_state: Option<ClusterState>,

    /// masters to monitor, comma-separated host:port
    #[arg(long, env = "VIGIL_MASTERS", value_delimiter = ',')]
    masters: Option<Vec<String>>,

    /// new replaces the monitored set with --masters; existing adds to it
    #[arg(long, env = "VIGIL_MASTERS_STATE")]
    masters_state: Option<MastersState>,

    /// how often masters are checked (e.g. "1s", "500ms")
    #[arg(long, env = "VIGIL_CHECK_INTERVAL")]
    check_interval: Option<String>,

    /// keep monitoring a master's group after failover, under the promoted slave
    #[arg(long, env = "VIGIL_FOLLOW_PROMOTED")]
    follow_promoted: Option<bool>,

    /// dedicated port for prometheus /metrics and /health
    #[arg(long, env = "VIGIL_METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// Applies CLI overrides to a `VigilConfig`. Only `Some` values take
/// effect, so the order is defaults, then TOML file, then env and flags.
fn apply_args(cfg: &mut VigilConfig, args: &Args) {
    if let Some(ref addr) = args.addr {
        cfg.addr = addr.clone();
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(id) = args.server_id {
        cfg.server_id = id;
    }
    if let Some(ref peers) = args.cluster {
        cfg.cluster = peers.clone();
    }
    if let Some(state) = args.cluster_state {
        cfg.cluster_state = state;
    }
    if let Some(ref masters) = args.masters {
        cfg.masters = masters.clone();
    }
    if let Some(state) = args.masters_state {
        cfg.masters_state = state;
    }
    if let Some(ref interval) = args.check_interval {
        cfg.check_interval = interval.clone();
    }
    if let Some(follow) = args.follow_promoted {
        cfg.follow_promoted = follow;
    }
    if let Some(port) = args.metrics_port {
        cfg.metrics_port = Some(port);
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match VigilConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => VigilConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => VigilConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let settings = cfg
        .validate()
        .unwrap_or_else(|e| exit_err(format!("invalid configuration: {e}")));

    let handle = metrics::install_recorder().unwrap_or_else(|e| exit_err(e));

    info!(
        addr = %settings.addr,
        masters = settings.masters.len(),
        clustered = settings.raft.is_some(),
        "starting vigil"
    );

    if let Err(e) = server::run(settings, Some(handle)).await {
        exit_err(format!("server error: {e}"));
    }
}
