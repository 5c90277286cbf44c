//! Error categorization for the consensus core.
//!
//! Mirrors spec.md §7: most failures (protocol parse, connection loss) are
//! local and recoverable and never reach this enum — they are logged and
//! handled inline where they occur. `CoreError` exists for the handful of
//! errors that are either fatal (persistence failure, self removal) or
//! client-visible (no leader, redirect).

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No leader is currently known; the client should retry later. The
    /// leading `-` matches spec.md §4.4/E4's wire string literally.
    #[error("-NOLEADER")]
    NoLeader,

    /// A different node is leader; the client should redirect there.
    #[error("LEADERIS {0}")]
    LeaderIs(SocketAddr),

    /// The submitted entry was rejected by the algorithm library (e.g. not
    /// leader anymore by the time the write landed, or a concurrent
    /// membership change was in flight).
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The interpreter did not recognize the command or its arguments.
    #[error("unknown command or arguments")]
    UnknownCommand,

    /// A persistence failure (header flush, log append). Fatal: the caller
    /// must stop serving.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// This node applied a committed entry removing itself from the
    /// cluster. Fatal: the caller must stop serving.
    #[error("node removed from cluster, shutting down")]
    SelfRemoved,
}

impl CoreError {
    /// Whether this error means the node must stop serving, per spec.md §7's
    /// "persistence failure" and "self removal" categories.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Persistence(_) | CoreError::SelfRemoved)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("RAFT_JOIN=true requires JOIN_ADDR to be set")]
    MissingJoinAddr,

    #[error("a node cannot both RAFT_INIT and RAFT_JOIN")]
    ConflictingBootstrap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_and_self_removed_are_fatal() {
        assert!(CoreError::Persistence("disk full".into()).is_fatal());
        assert!(CoreError::SelfRemoved.is_fatal());
    }

    #[test]
    fn client_visible_errors_are_not_fatal() {
        assert!(!CoreError::NoLeader.is_fatal());
        assert!(!CoreError::Rejected("x".into()).is_fatal());
        assert!(!CoreError::UnknownCommand.is_fatal());
    }

    #[test]
    fn no_leader_display_matches_wire_string() {
        assert_eq!(CoreError::NoLeader.to_string(), "-NOLEADER");
    }

    #[test]
    fn leader_is_display_includes_address() {
        let addr: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        assert_eq!(CoreError::LeaderIs(addr).to_string(), "LEADERIS 10.0.0.1:7000");
    }
}
