//! Request queue and worker: spec.md §3's `Request` and §4.4's "Request
//! queue & worker" / handlers, reworked per spec.md §9's design note onto a
//! `tokio::mpsc` channel plus `oneshot` reply channels instead of a
//! mutex-guarded linked list and a raw blocked-client pointer.
//!
//! `submit` preserves FIFO ordering into the single consensus task (spec.md
//! §5); the worker loop `while let Some(req) = rx.recv().await` is this
//! crate's "drain to empty, dispatch by kind" (Tokio's channel already
//! batches, so there is no separate drain step to hand-roll).

use std::net::SocketAddr;

use openraft::error::ClientWriteError;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::codec::encode_argv;
use crate::errors::CoreError;
use crate::node::RaftNode;
use crate::raft_types::{CfgChange, Command, CommandResponse};
use crate::registry::NodeId;

/// One request kind per spec.md §3's tagged variant, each carrying the
/// oneshot sender that stands in for the "blocked-client handle" + "reply
/// context".
pub enum Request {
    /// spec.md §4.4's `handleRedisCommand`.
    Command {
        argv: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<CommandResponse, CoreError>>,
    },
    /// spec.md §4.4's `handleInfo`.
    Info { reply: oneshot::Sender<String> },
    /// spec.md §3's `CFGCHANGE_ADDNODE` (as a non-voting learner; promotion
    /// to voting happens via the promotion watcher once caught up).
    CfgChangeAddNode {
        cfg: CfgChange,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    /// spec.md §3's `CFGCHANGE_REMOVENODE`.
    CfgChangeRemoveNode {
        id: NodeId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Request>,
}

impl RequestQueue {
    /// spec.md §4.4's `submit`: enqueue, no blocking. Paired with a
    /// `Receiver` the consensus task owns exclusively.
    pub fn submit(&self, req: Request) {
        if self.tx.send(req).is_err() {
            warn!("request submitted after the consensus task stopped");
        }
    }
}

pub fn channel() -> (RequestQueue, mpsc::UnboundedReceiver<Request>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RequestQueue { tx }, rx)
}

/// The consensus task's event loop: spec.md §4.4's worker, dispatching each
/// request by kind until the node shuts down.
pub async fn run_worker(node: std::sync::Arc<RaftNode>, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(req) = rx.recv().await {
        if !node.running.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        match req {
            Request::Command { argv, reply } => {
                let _ = reply.send(handle_command(&node, argv).await);
            }
            Request::Info { reply } => {
                let _ = reply.send(node.status_report().await);
            }
            Request::CfgChangeAddNode { cfg, reply } => {
                let _ = reply.send(handle_cfg_change_add(&node, cfg).await);
            }
            Request::CfgChangeRemoveNode { id, reply } => {
                let _ = reply.send(handle_cfg_change_remove(&node, id).await);
            }
        }
    }
    info!("consensus request worker stopped");
}

/// spec.md §4.4's `handleRedisCommand`: redirect if not leader, otherwise
/// submit through `raft.client_write` and forward the interpreter's reply.
/// `client_write` only resolves after local apply, so "reply only after
/// local apply" (spec.md §5) falls out of openraft's own API — no separate
/// pending-commit bookkeeping is needed (see DESIGN.md).
async fn handle_command(node: &RaftNode, argv: Vec<Vec<u8>>) -> Result<CommandResponse, CoreError> {
    let result = match node.current_leader().await {
        None => Err(CoreError::NoLeader),
        Some(leader) if leader != node.id => match node.peer_addr(leader) {
            Some(addr) => Err(CoreError::LeaderIs(addr)),
            None => Err(CoreError::NoLeader),
        },
        Some(_) => {
            let data = encode_argv(&argv);
            match node.raft.client_write(Command(data)).await {
                Ok(resp) => Ok(resp.data),
                Err(e) => Err(client_write_error_to_core(e)),
            }
        }
    };
    crate::metrics::COMMANDS_TOTAL
        .with_label_values(&[if result.is_ok() { "ok" } else { "error" }])
        .inc();
    result
}

fn client_write_error_to_core(
    e: openraft::error::RaftError<NodeId, ClientWriteError<NodeId, openraft::BasicNode>>,
) -> CoreError {
    use openraft::error::{ClientWriteError, RaftError};
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => match fwd.leader_node {
            Some(n) => n
                .addr
                .parse::<SocketAddr>()
                .map(CoreError::LeaderIs)
                .unwrap_or(CoreError::NoLeader),
            None => CoreError::NoLeader,
        },
        other => CoreError::Rejected(other.to_string()),
    }
}

async fn handle_cfg_change_add(node: &RaftNode, cfg: CfgChange) -> Result<(), CoreError> {
    let Some(addr) = cfg.addr() else {
        return Err(CoreError::Rejected("invalid peer address".into()));
    };
    let Some(client_addr) = cfg.client_addr() else {
        return Err(CoreError::Rejected("invalid peer client address".into()));
    };
    let basic = openraft::BasicNode {
        addr: crate::raft_types::encode_basic_node_addr(addr, client_addr.port()),
    };
    node.raft
        .add_learner(cfg.id, basic, true)
        .await
        .map(|_| ())
        .map_err(|e| CoreError::Rejected(e.to_string()))?;
    // `add_learner`'s own committed `Membership` entry carries the encoded
    // client port to every node via `sync_from_membership`; this call just
    // makes it visible on *this* node immediately, without waiting on the
    // entry to round-trip back through `append_to_log`.
    node.registry.lock().unwrap().set_client_addr(cfg.id, client_addr);
    node.register_promotion_watch(cfg.id);
    Ok(())
}

/// spec.md §3's "destroyed on a committed `REMOVE_NODE`" contract covers
/// both voters and non-voting learners. A learner isn't in the voter set at
/// all, so rewriting the voter set (`ReplaceAllVoters`) leaves it untouched
/// — it has to be dropped via openraft's own learner-removal path instead.
async fn handle_cfg_change_remove(node: &RaftNode, id: NodeId) -> Result<(), CoreError> {
    let voters = node.voter_ids().await;
    if voters.contains(&id) {
        let mut remaining: std::collections::BTreeSet<NodeId> =
            voters.into_iter().filter(|m| *m != id).collect();
        if remaining.is_empty() {
            remaining.insert(node.id);
        }
        node.raft
            .change_membership(remaining, false)
            .await
            .map(|_| ())
            .map_err(|e| CoreError::Rejected(e.to_string()))
    } else {
        let targets: std::collections::BTreeSet<NodeId> = std::iter::once(id).collect();
        node.raft
            .change_membership(openraft::ChangeMembers::RemoveNodes(targets), false)
            .await
            .map(|_| ())
            .map_err(|e| CoreError::Rejected(e.to_string()))
    }
}
