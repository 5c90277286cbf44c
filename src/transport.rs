//! gRPC transport adapter: spec.md §4.1's `send_requestvote`/
//! `send_appendentries` and §4.3's per-peer connection state machine,
//! implemented as `openraft::RaftNetwork`/`RaftNetworkFactory` over the
//! `ConsensusService` defined in `proto/raftkv.proto` — generalizing the
//! teacher's `raft.rs::GrpcNetwork`/`GrpcNetworkFactory` (which talked to
//! `LoadTestCoordinator`) onto this crate's own proto service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use crate::proto::consensus_service_client::ConsensusServiceClient;
use crate::proto::{
    AppendEntriesRequest as ProtoAppendEntriesRequest, SnapshotRequest as ProtoSnapshotRequest,
    VoteRequest as ProtoVoteRequest,
};
use crate::raft_types::{NodeId, TypeConfig};
use crate::registry::{ConnState, NodeRegistry};

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer lazily-connected gRPC channel implementing `RaftNetwork`.
///
/// Connection-state transitions (spec.md §4.3): `Disconnected ->
/// Connecting` on the first send attempt via `get_client`, `Connecting ->
/// Connected` once `connect_lazy`'s first RPC actually succeeds, and any
/// RPC failure reverts the peer to `Disconnected` so the next send redials.
pub struct GrpcNetwork {
    target_id: NodeId,
    target_addr: String,
    client: Option<ConsensusServiceClient<Channel>>,
    registry: Arc<Mutex<NodeRegistry>>,
}

impl GrpcNetwork {
    fn mark(&self, state: ConnState) {
        self.registry.lock().unwrap().set_state(self.target_id, state);
    }

    fn get_client(&mut self) -> Result<ConsensusServiceClient<Channel>, String> {
        if self.client.is_none() {
            self.mark(ConnState::Connecting);
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() defers the handshake to the first RPC, so the
            // state doesn't flip to Connected until a call actually
            // succeeds (below) — tonic redials automatically on failure.
            let channel = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(ConsensusServiceClient::new(channel));
        }
        Ok(self.client.clone().unwrap())
    }
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;
        let leader_id = rpc.vote.leader_id().node_id;

        let mut client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let result = client
            .append_entries(ProtoAppendEntriesRequest {
                term,
                leader_id,
                payload,
            })
            .await;

        match result {
            Ok(resp) => {
                self.mark(ConnState::Connected);
                crate::metrics::RPC_TOTAL.with_label_values(&["append_entries", "ok"]).inc();
                serde_json::from_slice(&resp.into_inner().payload).map_err(|e| {
                    warn!(peer = self.target_id, error = %e, "malformed AppendEntries reply, discarding");
                    RPCError::Unreachable(unreachable(e))
                })
            }
            Err(e) => {
                self.mark(ConnState::Disconnected);
                self.client = None;
                crate::metrics::RPC_TOTAL.with_label_values(&["append_entries", "error"]).inc();
                Err(RPCError::Unreachable(unreachable(e)))
            }
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;
        let candidate_id = rpc.vote.leader_id().node_id;

        let mut client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let result = client
            .request_vote(ProtoVoteRequest {
                term,
                candidate_id,
                payload,
            })
            .await;

        match result {
            Ok(resp) => {
                self.mark(ConnState::Connected);
                crate::metrics::RPC_TOTAL.with_label_values(&["vote", "ok"]).inc();
                serde_json::from_slice(&resp.into_inner().payload).map_err(|e| {
                    warn!(peer = self.target_id, error = %e, "malformed RequestVote reply, discarding");
                    RPCError::Unreachable(unreachable(e))
                })
            }
            Err(e) => {
                self.mark(ConnState::Disconnected);
                self.client = None;
                crate::metrics::RPC_TOTAL.with_label_values(&["vote", "error"]).inc();
                Err(RPCError::Unreachable(unreachable(e)))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let term = rpc.vote.leader_id().term;

        let mut client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let result = client
            .install_snapshot(ProtoSnapshotRequest { term, payload })
            .await;

        match result {
            Ok(resp) => {
                self.mark(ConnState::Connected);
                crate::metrics::RPC_TOTAL.with_label_values(&["install_snapshot", "ok"]).inc();
                serde_json::from_slice(&resp.into_inner().payload)
                    .map_err(|e| RPCError::Unreachable(unreachable(e)))
            }
            Err(e) => {
                self.mark(ConnState::Disconnected);
                self.client = None;
                crate::metrics::RPC_TOTAL.with_label_values(&["install_snapshot", "error"]).inc();
                Err(RPCError::Unreachable(unreachable(e)))
            }
        }
    }
}

/// Creates a [`GrpcNetwork`] per target peer; `registry` is shared so the
/// connection-state transitions above are visible to `handle_info`'s status
/// report (spec.md §4.4).
pub struct GrpcNetworkFactory {
    pub registry: Arc<Mutex<NodeRegistry>>,
}

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        // `node.addr` is the encoded `consensus_addr|client_port` string (see
        // `raft_types::encode_basic_node_addr`); only the consensus address
        // is a dialable `ConsensusService` endpoint.
        let target_addr = crate::raft_types::decode_basic_node_addr(&node.addr)
            .map(|(consensus_addr, _)| consensus_addr.to_string())
            .unwrap_or_else(|| node.addr.clone());
        GrpcNetwork {
            target_id: target,
            target_addr,
            client: None,
            registry: self.registry.clone(),
        }
    }
}
