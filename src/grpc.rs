//! gRPC servers for the two services in `proto/raftkv.proto`: the
//! peer-to-peer `ConsensusService` (forwards straight into
//! `openraft::Raft`) and the client-facing `CommandService` (forwards into
//! the [`crate::request::RequestQueue`]), replacing the teacher's
//! `LoadTestCoordinatorService`.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, instrument};

use crate::errors::CoreError;
use crate::node::RaftNode;
use crate::proto::command_service_server::CommandService;
use crate::proto::consensus_service_server::ConsensusService;
use crate::proto::{
    AddNodeRequest, AppendEntriesRequest, AppendEntriesResponse, CfgChangeReply, CommandReply,
    CommandRequest, InfoReply, InfoRequest, RemoveNodeRequest, SnapshotRequest, SnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft_types::CfgChange;
use crate::request::{Request as CoreRequest, RequestQueue};

fn bad_payload(err: impl std::fmt::Display) -> Status {
    Status::invalid_argument(format!("malformed payload: {err}"))
}

/// Forwards each RPC straight into `openraft::Raft`, deserializing the
/// openraft request type out of `payload` and re-serializing the response
/// the same way (spec.md §4.1's RPC handlers, minus the hand-rolled
/// protocol this crate replaces with tonic/prost).
pub struct ConsensusServiceImpl {
    pub node: Arc<RaftNode>,
}

#[tonic::async_trait]
impl ConsensusService for ConsensusServiceImpl {
    #[instrument(skip_all)]
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let rpc = serde_json::from_slice(&req.payload).map_err(bad_payload)?;
        let resp = self
            .node
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(AppendEntriesResponse {
            term: req.term,
            success: true,
            payload,
        }))
    }

    #[instrument(skip_all)]
    async fn vote(&self, request: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        let rpc = serde_json::from_slice(&req.payload).map_err(bad_payload)?;
        let resp = self
            .node
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(VoteResponse {
            term: req.term,
            vote_granted: resp.vote_granted,
            payload,
        }))
    }

    #[instrument(skip_all)]
    async fn install_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let req = request.into_inner();
        let rpc = serde_json::from_slice(&req.payload).map_err(bad_payload)?;
        let resp = self
            .node
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(SnapshotResponse { payload }))
    }
}

/// Forwards each client request into the consensus task's request queue and
/// awaits the oneshot reply, per spec.md §4.4.
pub struct CommandServiceImpl {
    pub queue: RequestQueue,
}

fn core_error_to_reply(err: CoreError) -> CommandReply {
    CommandReply {
        ok: false,
        value: Vec::new(),
        error: err.to_string(),
    }
}

#[tonic::async_trait]
impl CommandService for CommandServiceImpl {
    #[instrument(skip_all)]
    async fn command(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandReply>, Status> {
        let argv = request.into_inner().argv;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.submit(CoreRequest::Command { argv, reply: tx });
        let reply = match rx.await {
            Ok(Ok(resp)) => CommandReply {
                ok: resp.ok,
                value: resp.value,
                error: resp.error.unwrap_or_default(),
            },
            Ok(Err(core_err)) => core_error_to_reply(core_err),
            Err(_) => {
                error!("consensus task dropped the command reply channel");
                return Err(Status::unavailable("node is shutting down"));
            }
        };
        Ok(Response::new(reply))
    }

    #[instrument(skip_all)]
    async fn info(&self, _request: Request<InfoRequest>) -> Result<Response<InfoReply>, Status> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue.submit(CoreRequest::Info { reply: tx });
        let report = rx
            .await
            .map_err(|_| Status::unavailable("node is shutting down"))?;
        Ok(Response::new(InfoReply { report }))
    }

    #[instrument(skip_all)]
    async fn add_node(
        &self,
        request: Request<AddNodeRequest>,
    ) -> Result<Response<CfgChangeReply>, Status> {
        let req = request.into_inner();
        let cfg = match CfgChange::new(req.id, req.host, req.port as u16, req.client_port as u16) {
            Ok(cfg) => cfg,
            Err(e) => {
                return Ok(Response::new(CfgChangeReply {
                    ok: false,
                    error: e.to_string(),
                }))
            }
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue
            .submit(CoreRequest::CfgChangeAddNode { cfg, reply: tx });
        let reply = match rx.await {
            Ok(Ok(())) => CfgChangeReply {
                ok: true,
                error: String::new(),
            },
            Ok(Err(e)) => CfgChangeReply {
                ok: false,
                error: e.to_string(),
            },
            Err(_) => return Err(Status::unavailable("node is shutting down")),
        };
        Ok(Response::new(reply))
    }

    #[instrument(skip_all)]
    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> Result<Response<CfgChangeReply>, Status> {
        let id = request.into_inner().id;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.queue
            .submit(CoreRequest::CfgChangeRemoveNode { id, reply: tx });
        let reply = match rx.await {
            Ok(Ok(())) => CfgChangeReply {
                ok: true,
                error: String::new(),
            },
            Ok(Err(e)) => CfgChangeReply {
                ok: false,
                error: e.to_string(),
            },
            Err(_) => return Err(Status::unavailable("node is shutting down")),
        };
        Ok(Response::new(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_types::CommandResponse;

    #[test]
    fn command_reply_carries_core_error_text() {
        let reply = core_error_to_reply(CoreError::NoLeader);
        assert!(!reply.ok);
        assert_eq!(reply.error, "-NOLEADER");
    }

    #[tokio::test]
    async fn queue_round_trip_resolves_command() {
        let (queue, mut rx) = crate::request::channel();
        let handle = tokio::spawn(async move {
            if let Some(CoreRequest::Command { reply, .. }) = rx.recv().await {
                let _ = reply.send(Ok(CommandResponse::ok(b"v".to_vec())));
            }
        });
        let (tx, reply_rx) = tokio::sync::oneshot::channel();
        queue.submit(CoreRequest::Command {
            argv: vec![b"GET".to_vec(), b"k".to_vec()],
            reply: tx,
        });
        let resp = reply_rx.await.unwrap().unwrap();
        assert_eq!(resp.value, b"v");
        handle.await.unwrap();
    }
}
