//! openraft wiring: type configuration, outbound RPC client, and the
//! listener for inbound RPCs.

use std::io::{self, Cursor};
use std::net::SocketAddr;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory as RaftNetworkFactoryTrait};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{BasicNode, Entry, Raft, RaftTypeConfig};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::{MasterCommand, MasterResponse};

use crate::raft_transport::{read_frame, write_frame, RaftRpc, RaftRpcResponse};

/// Type configuration for openraft.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = MasterCommand;
    type R = MasterResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Per-peer network handle. Opens a short-lived TCP connection per RPC.
pub struct RaftNetworkClient {
    target: u64,
    target_addr: String,
}

impl RaftNetwork<TypeConfig> for RaftNetworkClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::AppendEntries(rpc)).await? {
            RaftRpcResponse::AppendEntries(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::Vote(rpc)).await? {
            RaftRpcResponse::Vote(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let resp = self
            .send_rpc(RaftRpc::InstallSnapshot(rpc))
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        match resp {
            RaftRpcResponse::InstallSnapshot(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }
}

impl RaftNetworkClient {
    async fn call(
        &self,
        rpc: RaftRpc,
    ) -> Result<RaftRpcResponse, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send_rpc(rpc).await.map_err(|e| {
            debug!(target = self.target, addr = %self.target_addr, "raft rpc failed: {e}");
            RPCError::Unreachable(Unreachable::new(&e))
        })
    }

    /// Opens a TCP connection, sends one frame, reads one frame, and closes.
    async fn send_rpc(&self, rpc: RaftRpc) -> io::Result<RaftRpcResponse> {
        let mut stream = TcpStream::connect(self.target_addr.as_str()).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &rpc).await?;
        read_frame(&mut stream).await
    }
}

fn unexpected_variant<E: std::error::Error>() -> RPCError<u64, BasicNode, E> {
    RPCError::Network(NetworkError::new(&io::Error::other(
        "unexpected response variant",
    )))
}

/// Creates per-peer [`RaftNetworkClient`]s. `BasicNode::addr` holds the
/// peer's raft listener address.
pub struct RaftNetworkFactory;

impl RaftNetworkFactoryTrait<TypeConfig> for RaftNetworkFactory {
    type Network = RaftNetworkClient;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> RaftNetworkClient {
        RaftNetworkClient {
            target,
            target_addr: node.addr.clone(),
        }
    }
}

/// Serves inbound raft RPCs on an already-bound listener.
///
/// Each connection carries one request frame and one response frame.
/// Aborting the returned handle stops accepting.
pub(crate) fn spawn_raft_listener(raft: Raft<TypeConfig>, listener: TcpListener) -> JoinHandle<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("raft listener on {addr}");
    }

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_rpc(raft.clone(), stream, peer));
                }
                Err(e) => warn!("raft accept error: {e}"),
            }
        }
    })
}

async fn serve_rpc(raft: Raft<TypeConfig>, mut stream: TcpStream, peer: SocketAddr) {
    let rpc: RaftRpc = match read_frame(&mut stream).await {
        Ok(rpc) => rpc,
        Err(e) => {
            debug!(%peer, "raft read failed: {e}");
            return;
        }
    };

    // no reply on error; the caller sees a closed connection and retries
    let response = match handle_rpc(&raft, rpc).await {
        Ok(response) => response,
        Err(e) => {
            debug!(%peer, "raft rpc rejected: {e}");
            return;
        }
    };

    if let Err(e) = write_frame(&mut stream, &response).await {
        debug!(%peer, "raft write failed: {e}");
    }
}

async fn handle_rpc(raft: &Raft<TypeConfig>, rpc: RaftRpc) -> Result<RaftRpcResponse, String> {
    match rpc {
        RaftRpc::AppendEntries(req) => raft
            .append_entries(req)
            .await
            .map(RaftRpcResponse::AppendEntries)
            .map_err(|e| format!("append_entries: {e}")),
        RaftRpc::Vote(req) => raft
            .vote(req)
            .await
            .map(RaftRpcResponse::Vote)
            .map_err(|e| format!("vote: {e}")),
        RaftRpc::InstallSnapshot(req) => {
            // the master set is small, so snapshots always travel whole
            let snapshot = Snapshot {
                meta: req.meta,
                snapshot: Box::new(Cursor::new(req.data)),
            };
            let resp = raft
                .install_full_snapshot(req.vote, snapshot)
                .await
                .map_err(|e| format!("install_snapshot: {e}"))?;
            Ok(RaftRpcResponse::InstallSnapshot(InstallSnapshotResponse {
                vote: resp.vote,
            }))
        }
    }
}
