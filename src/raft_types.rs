//! openraft type configuration and the application-level log entry payload.
//!
//! `Command` is the `D` type of [`openraft::Entry`]: either a `Normal` entry
//! carrying a codec-encoded argv buffer (spec.md §3), or one of the
//! cfg-change variants carrying a [`CfgChange`] record. Keeping cfg-change as
//! an explicit variant (rather than relying solely on openraft's own
//! `EntryPayload::Membership`) gives `PersistentLog::append_to_log`
//! (spec.md's `log_offer`) a concrete record to mutate the node registry
//! from at offer time — see DESIGN.md.

use std::net::SocketAddr;

use openraft::{BasicNode, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::NodeId;

/// Maximum length of a cfg-change record's host field, per spec.md §3's
/// "fixed record {id, addr: {host: string[<=N], port}}".
pub const MAX_HOST_LEN: usize = 253; // longest legal DNS name

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CfgChangeError {
    #[error("host name too long: {0} bytes (max {MAX_HOST_LEN})")]
    HostTooLong(usize),
}

/// Fixed cfg-change record, per spec.md §3: `{id: u32, addr: {host, port}}`
/// (widened to `u64` ids here to match openraft's `NodeId`).
///
/// Carries two ports rather than spec.md's single `{host, port}`: `port` is
/// the peer's consensus/Raft-RPC port (what `openraft::BasicNode::addr`
/// needs so `GrpcNetwork` can dial `ConsensusService`), and `client_port` is
/// the peer's client-facing `CommandService` port. Both travel together
/// inside the single `BasicNode::addr` string via `encode_basic_node_addr`,
/// so openraft's own membership replication carries `client_port` to every
/// node, not just the one that processed this request. `NodeRegistry` keeps
/// a `client_addrs` side table as a queryable cache of what membership
/// already carries (see `NodeRegistry::set_client_addr`). Without this,
/// `-ERR LEADERIS` redirects would point clients at the leader's internal
/// Raft port instead of the port that actually serves `CommandService`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CfgChange {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub client_port: u16,
}

impl CfgChange {
    pub fn new(
        id: NodeId,
        host: impl Into<String>,
        port: u16,
        client_port: u16,
    ) -> Result<Self, CfgChangeError> {
        let host = host.into();
        if host.len() > MAX_HOST_LEN {
            return Err(CfgChangeError::HostTooLong(host.len()));
        }
        Ok(Self {
            id,
            host,
            port,
            client_port,
        })
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.client_port).parse().ok()
    }
}

/// Packs a peer's client-facing `CommandService` port onto its consensus
/// address before handing it to openraft as `BasicNode::addr`. This is what
/// lets the client-facing address travel inside openraft's own replicated
/// membership entries — and therefore reach every node in the cluster, not
/// just the leader that happened to process the `AddNode` request — instead
/// of needing a request-scoped side channel. `decode_basic_node_addr`
/// reverses it.
pub fn encode_basic_node_addr(consensus_addr: SocketAddr, client_port: u16) -> String {
    format!("{consensus_addr}|{client_port}")
}

/// Reverses `encode_basic_node_addr`, returning `(consensus_addr,
/// client_addr)`. Returns `None` for a malformed or legacy-format address.
pub fn decode_basic_node_addr(encoded: &str) -> Option<(SocketAddr, SocketAddr)> {
    let (consensus, client_port) = encoded.split_once('|')?;
    let consensus_addr: SocketAddr = consensus.parse().ok()?;
    let client_port: u16 = client_port.parse().ok()?;
    Some((consensus_addr, SocketAddr::new(consensus_addr.ip(), client_port)))
}

/// Application log entry payload: the `D` type parameter of
/// [`openraft::Entry`], per spec.md §3's "Raft entry".
///
/// Cluster membership changes are not carried here — `Raft::change_membership`
/// produces openraft's own `EntryPayload::Membership` entries, which
/// `PersistentLog::append_to_log` inspects directly to mutate the
/// [`crate::registry::NodeRegistry`] at offer time (spec.md §4.1, §9).
/// [`CfgChange`] is the wire/client-facing record a `CfgChangeAdd` /
/// `CfgChangeRemove` request carries before it is translated into a
/// `change_membership` call; it never appears inside a log entry itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command(pub Vec<u8>);

/// Response returned by the interpreter for a committed `Normal` entry, or a
/// synthetic acknowledgement for cfg-change / blank entries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandResponse {
    pub ok: bool,
    pub value: Vec<u8>,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: Vec::new(),
            error: Some(message.into()),
        }
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = Entry<TypeConfig>,
        SnapshotData = std::io::Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfg_change_rejects_overlong_host() {
        let host = "a".repeat(MAX_HOST_LEN + 1);
        assert_eq!(
            CfgChange::new(1, host, 7000, 7001),
            Err(CfgChangeError::HostTooLong(MAX_HOST_LEN + 1))
        );
    }

    #[test]
    fn cfg_change_accepts_max_len_host() {
        let host = "a".repeat(MAX_HOST_LEN);
        assert!(CfgChange::new(1, host, 7000, 7001).is_ok());
    }

    #[test]
    fn cfg_change_addr_parses() {
        let c = CfgChange::new(1, "127.0.0.1", 7000, 7001).unwrap();
        assert_eq!(c.addr(), Some("127.0.0.1:7000".parse().unwrap()));
    }

    #[test]
    fn cfg_change_client_addr_uses_client_port() {
        let c = CfgChange::new(1, "127.0.0.1", 7000, 7001).unwrap();
        assert_eq!(c.client_addr(), Some("127.0.0.1:7001".parse().unwrap()));
    }

    #[test]
    fn command_response_err_has_no_value() {
        let r = CommandResponse::err("boom");
        assert!(!r.ok);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(r.value.is_empty());
    }
}
