//! Bootstrap paths (spec.md §4.6) and the `RaftNode` "Core context" (spec.md
//! §3): the owned value that replaces the source's process-wide global
//! context (spec.md §9's design note), constructed once in `main` and
//! shared via `Arc` with the gRPC services.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openraft::{BasicNode, Config as RaftConfig};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::errors::CoreError;
use crate::interpreter::Interpreter;
use crate::log::{self, PersistentLog};
use crate::raft_types::{encode_basic_node_addr, NodeId, RaftInstance};
use crate::registry::NodeRegistry;
use crate::request::RequestQueue;
use crate::transport::GrpcNetworkFactory;

/// spec.md §3's "Core context": owns the `openraft::Raft` handle, the node
/// registry, and the running flag the consensus task and its helper tasks
/// (promotion watcher, periodic tick) share. Cloned as an `Arc` into the
/// gRPC server so request handlers can reach it without a global.
pub struct RaftNode {
    pub raft: Arc<RaftInstance>,
    pub id: NodeId,
    pub client_addr: SocketAddr,
    pub registry: Arc<Mutex<NodeRegistry>>,
    /// Cleared by `PersistentLog::apply_to_state_machine` when a committed
    /// entry removes this node (spec.md §7's self-removal fatal path).
    pub running: Arc<AtomicBool>,
    /// Commit index and log-entries count, pushed by `PersistentLog`
    /// (spec.md §4.4's `handleInfo` needs both and `Raft::metrics()` exposes
    /// neither distinctly from `last_applied` — see DESIGN.md).
    pub log_status: tokio::sync::watch::Receiver<log::LogStatus>,
}

impl RaftNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Synchronous variant of [`Self::current_leader`], for callers (tests,
    /// `is_leader`) that only need a snapshot of the watch channel and have
    /// no need to `.await` for one.
    pub fn current_leader_blocking(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The client-facing `CommandService` address to redirect a client to
    /// for this peer (spec.md §4.4's `LEADERIS host:port`) — NOT the same as
    /// the peer's consensus/Raft-RPC address `GrpcNetwork` dials; see
    /// `NodeRegistry::client_addr`'s doc comment.
    pub fn peer_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.registry.lock().unwrap().client_addr(id)
    }

    pub async fn voter_ids(&self) -> Vec<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    /// spec.md §4.4's `handleInfo` status document.
    pub async fn status_report(&self) -> String {
        let metrics = self.raft.metrics().borrow().clone();
        let role = match metrics.state {
            openraft::ServerState::Leader => "leader",
            openraft::ServerState::Candidate => "candidate",
            openraft::ServerState::Follower => "follower",
            openraft::ServerState::Learner => "learner",
            openraft::ServerState::Shutdown => "shutdown",
        };
        let log_status = *self.log_status.borrow();
        let mut lines = vec![
            format!("node_id:{}", self.id),
            format!("role:{role}"),
            format!("leader_id:{}", metrics.current_leader.map(|l| l.to_string()).unwrap_or_else(|| "none".into())),
            format!("term:{}", metrics.current_term),
            format!("log_entries:{}", log_status.entries),
            format!("last_log_index:{}", metrics.last_log_index.unwrap_or(0)),
            format!("commit_index:{}", log_status.commit_index),
            format!(
                "last_applied:{}",
                metrics.last_applied.map(|l| l.index).unwrap_or(0)
            ),
        ];
        let registry = self.registry.lock().unwrap();
        for n in registry.iter() {
            lines.push(format!(
                "node{}:id={},state={:?},addr={},port={}",
                n.id,
                n.id,
                n.state,
                n.addr.ip(),
                n.addr.port()
            ));
        }
        lines.join("\n")
    }

    /// spec.md §4.1's `node_has_sufficient_logs`: openraft has no 1:1
    /// callback, so this crate spawns a short-lived watcher task per
    /// learner that polls `Raft::metrics()` and promotes it once its
    /// matched index is within one entry of the leader's last log index
    /// (documented redesign, not a guess — see DESIGN.md).
    pub fn register_promotion_watch(self: &Arc<Self>, learner: NodeId) {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(250)).await;
                if !node.running.load(Ordering::SeqCst) || !node.is_leader() {
                    return;
                }
                let metrics = node.raft.metrics().borrow().clone();
                let Some(last_index) = metrics.last_log_index else {
                    continue;
                };
                let caught_up = metrics
                    .replication
                    .as_ref()
                    .and_then(|r| r.get(&learner).copied())
                    .flatten()
                    .map(|id| id.index + 1 >= last_index)
                    .unwrap_or(false);
                if !caught_up {
                    continue;
                }
                let mut members = node.voter_ids().await;
                members.push(learner);
                let members: std::collections::BTreeSet<NodeId> = members.into_iter().collect();
                match node.raft.change_membership(members, false).await {
                    Ok(_) => {
                        info!(learner, "promoted caught-up learner to voting member");
                        return;
                    }
                    Err(e) => {
                        warn!(learner, error = %e, "promotion attempt failed, retrying");
                    }
                }
            }
        });
    }
}

fn raft_config() -> Arc<RaftConfig> {
    Arc::new(
        RaftConfig {
            heartbeat_interval: 500,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    )
}

async fn build_raft(
    cfg: &NodeConfig,
    log: PersistentLog,
    registry: Arc<Mutex<NodeRegistry>>,
) -> Arc<RaftInstance> {
    let (log_store, state_machine) = log::split(log);
    Arc::new(
        openraft::Raft::new(
            cfg.id,
            raft_config(),
            GrpcNetworkFactory { registry },
            log_store,
            state_machine,
        )
        .await
        .expect("failed to construct Raft instance"),
    )
}

/// spec.md §4.6's `init`: create the log, become the sole voting member,
/// submit an `ADD_NODE` entry for self via `raft.initialize`.
pub async fn init(
    cfg: &NodeConfig,
    interpreter: Arc<dyn Interpreter>,
) -> Result<(Arc<RaftNode>, RequestQueue), CoreError> {
    let registry = Arc::new(Mutex::new(NodeRegistry::new()));
    let running = Arc::new(AtomicBool::new(true));
    let path = cfg
        .raftlog_path
        .clone()
        .unwrap_or_else(|| log::default_log_path(cfg.id).to_string_lossy().into_owned());

    let (log, status_rx) =
        PersistentLog::create(&path, cfg.id, registry.clone(), interpreter, running.clone())
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
    let raft = build_raft(cfg, log, registry.clone()).await;

    let mut members: BTreeMap<NodeId, BasicNode> = BTreeMap::new();
    members.insert(
        cfg.id,
        BasicNode {
            addr: encode_basic_node_addr(cfg.bind_addr, cfg.client_addr.port()),
        },
    );
    raft.initialize(members)
        .await
        .map_err(|e| CoreError::Rejected(format!("initialize failed: {e}")))?;
    {
        let mut reg = registry.lock().unwrap();
        reg.insert(cfg.id, cfg.bind_addr, true, cfg.id);
        reg.set_client_addr(cfg.id, cfg.client_addr);
    }

    info!(node_id = cfg.id, "initialized as founding member");
    spawn(cfg, raft, registry, running, status_rx)
}

/// spec.md §4.6's `join`: create the log, start as a learner; the existing
/// leader must `add_learner` this id. Promotion to voting happens via the
/// leader's promotion watcher once replication catches up.
pub async fn join(
    cfg: &NodeConfig,
    interpreter: Arc<dyn Interpreter>,
) -> Result<(Arc<RaftNode>, RequestQueue), CoreError> {
    let registry = Arc::new(Mutex::new(NodeRegistry::new()));
    let running = Arc::new(AtomicBool::new(true));
    let path = cfg
        .raftlog_path
        .clone()
        .unwrap_or_else(|| log::default_log_path(cfg.id).to_string_lossy().into_owned());

    let (log, status_rx) =
        PersistentLog::create(&path, cfg.id, registry.clone(), interpreter, running.clone())
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
    let raft = build_raft(cfg, log, registry.clone()).await;
    {
        let mut reg = registry.lock().unwrap();
        reg.insert(cfg.id, cfg.bind_addr, false, cfg.id);
        reg.set_client_addr(cfg.id, cfg.client_addr);
    }

    info!(node_id = cfg.id, join_addr = ?cfg.join_addr, "joining as non-voting member; awaiting leader's add_learner");
    spawn(cfg, raft, registry, running, status_rx)
}

/// spec.md §4.6's `recover`: open the existing log; `PersistentLog::open`
/// already replays entries, restores the commit index, applies everything
/// committed, and restores vote/term before this function ever touches
/// `openraft::Raft::new` (which itself re-reads that state via
/// `get_log_state`/`last_applied_state`, satisfying openraft's own startup
/// contract).
pub async fn recover(
    cfg: &NodeConfig,
    interpreter: Arc<dyn Interpreter>,
) -> Result<(Arc<RaftNode>, RequestQueue), CoreError> {
    let registry = Arc::new(Mutex::new(NodeRegistry::new()));
    let running = Arc::new(AtomicBool::new(true));
    let path = cfg
        .raftlog_path
        .clone()
        .unwrap_or_else(|| log::default_log_path(cfg.id).to_string_lossy().into_owned());

    let (log, status_rx) =
        PersistentLog::open(&path, cfg.id, registry.clone(), interpreter, running.clone())
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
    let raft = build_raft(cfg, log, registry.clone()).await;
    // Client-facing addresses (unlike consensus addresses) are not part of
    // openraft's persisted membership, so they don't survive a restart for
    // any OTHER peer (see `NodeRegistry::client_addrs`'s doc comment) — a
    // documented limitation, not silently patched over. This node's own
    // address is always known locally, so register it regardless.
    registry.lock().unwrap().set_client_addr(cfg.id, cfg.client_addr);

    info!(node_id = cfg.id, path = %path, "recovered from existing log");
    spawn(cfg, raft, registry, running, status_rx)
}

/// Dispatches to `init`/`join`/`recover` per `NodeConfig`'s bootstrap flags,
/// mirroring the distilled spec's three startup paths (spec.md §4.6).
pub async fn bootstrap(
    cfg: &NodeConfig,
    interpreter: Arc<dyn Interpreter>,
) -> Result<(Arc<RaftNode>, RequestQueue), CoreError> {
    if cfg.init {
        init(cfg, interpreter).await
    } else if cfg.join {
        join(cfg, interpreter).await
    } else {
        recover(cfg, interpreter).await
    }
}

fn spawn(
    cfg: &NodeConfig,
    raft: Arc<RaftInstance>,
    registry: Arc<Mutex<NodeRegistry>>,
    running: Arc<AtomicBool>,
    log_status: tokio::sync::watch::Receiver<log::LogStatus>,
) -> Result<(Arc<RaftNode>, RequestQueue), CoreError> {
    let node = Arc::new(RaftNode {
        raft,
        id: cfg.id,
        client_addr: cfg.client_addr,
        registry,
        running,
        log_status,
    });
    let (queue, rx) = crate::request::channel();
    tokio::spawn(crate::request::run_worker(node.clone(), rx));
    Ok((node, queue))
}
