//! Node registry: per-peer identity, address, and connection state.
//!
//! Owned exclusively by the consensus task (spec.md §5 — no cross-thread
//! access). Entries are created when a cfg-change entry is offered to the
//! log (not yet committed) or when bootstrapping self, and destroyed when a
//! committed `RemoveNode` entry applies (spec.md §3).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use openraft::{BasicNode, Membership};

pub type NodeId = u64;

/// Connection state for a peer's transport adapter, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: ConnState,
    /// Whether this peer currently counts toward quorum.
    pub voting: bool,
    pub is_self: bool,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr, voting: bool, is_self: bool) -> Self {
        Self {
            id,
            addr,
            state: ConnState::Disconnected,
            voting,
            is_self,
        }
    }
}

/// Per-peer state, mutated at log-offer time for cfg-change entries
/// (spec.md §4.1, §9) and read by the transport adapter.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, NodeInfo>,
    /// Client-facing `CommandService` address per peer, used only for
    /// `-ERR LEADERIS` redirects. Kept separately from `NodeInfo::addr` (the
    /// consensus/Raft-RPC address `GrpcNetwork` dials) since those are two
    /// distinct listeners; populated by decoding the client port openraft's
    /// own replicated `BasicNode::addr` carries alongside the consensus
    /// address (see `raft_types::decode_basic_node_addr` and `CfgChange`'s
    /// doc comment), so it is available on every node, not just whichever
    /// one processed the original cfg-change request.
    client_addrs: HashMap<NodeId, SocketAddr>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node (cfg-change offer time), replacing any existing
    /// entry for the same id.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr, voting: bool, self_id: NodeId) {
        self.nodes
            .insert(id, NodeInfo::new(id, addr, voting, id == self_id));
    }

    /// Removes a node (committed `RemoveNode` apply time).
    pub fn remove(&mut self, id: NodeId) -> Option<NodeInfo> {
        self.client_addrs.remove(&id);
        self.nodes.remove(&id)
    }

    /// Records a peer's client-facing address, keyed off the cfg-change
    /// request that introduces it (see the `client_addrs` field doc).
    pub fn set_client_addr(&mut self, id: NodeId, addr: SocketAddr) {
        self.client_addrs.insert(id, addr);
    }

    /// The address clients should be redirected to for this peer, if known.
    pub fn client_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.client_addrs.get(&id).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Promotes a learner to a voting member, e.g. once the promotion
    /// watcher (spec.md §4.1's `node_has_sufficient_logs` analogue) observes
    /// it has caught up.
    pub fn promote(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.voting = true;
        }
    }

    /// Transitions a peer's connection state, per spec.md §4.3:
    /// `Disconnected -> Connecting` on first send, `Connecting -> Connected`
    /// on dial success, any failure reverts to `Disconnected`.
    pub fn set_state(&mut self, id: NodeId, state: ConnState) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.state = state;
        }
    }

    /// Reconciles the registry against a committed `openraft::Membership`,
    /// per spec.md §4.1's `log_offer` mutation rule. Rather than a bespoke
    /// cfg-change payload, this crate lets openraft's own membership entry
    /// be the authoritative source: nodes present in `membership` are
    /// inserted/updated (voting if in `membership.voter_ids()`, learner
    /// otherwise), preserving any existing connection state; nodes absent
    /// from `membership` but present in the registry are removed (spec.md
    /// §3's "destroyed on a committed `REMOVE_NODE` applying").
    ///
    /// Returns `true` if `self_id` was removed from the membership — the
    /// caller's cue to trigger spec.md §7's self-removal shutdown path.
    pub fn sync_from_membership(
        &mut self,
        membership: &Membership<NodeId, BasicNode>,
        self_id: NodeId,
    ) -> bool {
        let voters: HashSet<NodeId> = membership.voter_ids().collect();
        let mut seen = HashSet::new();

        for (id, node) in membership.nodes() {
            seen.insert(*id);
            let voting = voters.contains(id);
            let Some((consensus_addr, client_addr)) =
                crate::raft_types::decode_basic_node_addr(&node.addr)
            else {
                continue;
            };
            match self.nodes.get_mut(id) {
                Some(existing) => {
                    existing.voting = voting;
                }
                None => {
                    self.insert(*id, consensus_addr, voting, self_id);
                }
            }
            self.set_client_addr(*id, client_addr);
        }

        let stale: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        for id in stale {
            self.remove(id); // also drops the stale client_addrs entry
        }

        !seen.contains(&self_id)
    }
}
