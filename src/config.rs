//! Node configuration, loaded from environment variables.

use std::env;
use std::net::SocketAddr;

use crate::errors::ConfigError;

/// Helper to get a required environment variable.
fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse a boolean environment variable.
fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

/// Node configuration: identity, bind addresses, and bootstrap mode.
///
/// Exactly one of `init`/`join` may be true. Neither set means `recover`:
/// the node opens its existing log file and replays it.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's Raft id.
    pub id: u64,
    /// Address the consensus gRPC service (`ConsensusService`) listens on.
    pub bind_addr: SocketAddr,
    /// Address the client-facing gRPC service (`CommandService`) listens on.
    pub client_addr: SocketAddr,
    /// Address the Prometheus metrics + health endpoint listens on.
    pub metrics_addr: SocketAddr,
    /// Bootstrap as the founding (sole voting) member of a new cluster.
    pub init: bool,
    /// Bootstrap as a learner joining an existing cluster via `join_addr`.
    pub join: bool,
    /// Address of an existing cluster member to contact when `join` is set.
    pub join_addr: Option<SocketAddr>,
    /// Override for the on-disk log file path. Defaults to
    /// `raftkv-log-<id>.db` per spec.md §6.
    pub raftlog_path: Option<String>,
}

impl NodeConfig {
    /// Loads configuration from environment variables.
    ///
    /// `NODE_ID`, `BIND_ADDR`, `CLIENT_ADDR` are required. `METRICS_ADDR`
    /// defaults to `0.0.0.0:9090`. `RAFT_INIT`/`RAFT_JOIN` default to false
    /// (recover mode). `JOIN_ADDR` is required when `RAFT_JOIN=true`.
    /// `RAFTLOG_PATH` overrides the default log filename.
    pub fn from_env() -> Result<Self, ConfigError> {
        let id: u64 = env_parse_or("NODE_ID", 0)?;
        if id == 0 && env::var("NODE_ID").is_err() {
            return Err(ConfigError::MissingEnvVar("NODE_ID".into()));
        }

        let bind_addr = parse_addr("BIND_ADDR", &env_required("BIND_ADDR")?)?;
        let client_addr = parse_addr("CLIENT_ADDR", &env_required("CLIENT_ADDR")?)?;
        let metrics_addr = parse_addr(
            "METRICS_ADDR",
            &env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
        )?;

        let init = env_bool("RAFT_INIT", false);
        let join = env_bool("RAFT_JOIN", false);
        if init && join {
            return Err(ConfigError::ConflictingBootstrap);
        }

        let join_addr = match env::var("JOIN_ADDR") {
            Ok(v) => Some(parse_addr("JOIN_ADDR", &v)?),
            Err(_) => None,
        };
        if join && join_addr.is_none() {
            return Err(ConfigError::MissingJoinAddr);
        }

        let raftlog_path = env::var("RAFTLOG_PATH").ok();

        Ok(Self {
            id,
            bind_addr,
            client_addr,
            metrics_addr,
            init,
            join,
            join_addr,
            raftlog_path,
        })
    }

    /// The on-disk log file path for this node, per spec.md §6's default
    /// naming (`raftkv-log-<id>.db`) unless overridden.
    pub fn log_path(&self) -> String {
        self.raftlog_path
            .clone()
            .unwrap_or_else(|| format!("raftkv-log-{}.db", self.id))
    }
}

fn parse_addr(var: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var: var.into(),
        message: format!("'{}' is not a valid host:port address", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for var in [
            "NODE_ID",
            "BIND_ADDR",
            "CLIENT_ADDR",
            "METRICS_ADDR",
            "RAFT_INIT",
            "RAFT_JOIN",
            "JOIN_ADDR",
            "RAFTLOG_PATH",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_node_id_is_an_error() {
        clear_env();
        env::set_var("BIND_ADDR", "127.0.0.1:7000");
        env::set_var("CLIENT_ADDR", "127.0.0.1:7001");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::MissingEnvVar(_))
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn init_and_join_are_mutually_exclusive() {
        clear_env();
        env::set_var("NODE_ID", "1");
        env::set_var("BIND_ADDR", "127.0.0.1:7000");
        env::set_var("CLIENT_ADDR", "127.0.0.1:7001");
        env::set_var("RAFT_INIT", "true");
        env::set_var("RAFT_JOIN", "true");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::ConflictingBootstrap)
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn join_without_join_addr_is_an_error() {
        clear_env();
        env::set_var("NODE_ID", "2");
        env::set_var("BIND_ADDR", "127.0.0.1:7000");
        env::set_var("CLIENT_ADDR", "127.0.0.1:7001");
        env::set_var("RAFT_JOIN", "true");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::MissingJoinAddr)
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn default_log_path_uses_node_id() {
        clear_env();
        env::set_var("NODE_ID", "7");
        env::set_var("BIND_ADDR", "127.0.0.1:7000");
        env::set_var("CLIENT_ADDR", "127.0.0.1:7001");
        let cfg = NodeConfig::from_env().unwrap();
        assert_eq!(cfg.log_path(), "raftkv-log-7.db");
        clear_env();
    }

    #[test]
    #[serial]
    fn raftlog_path_override_is_honored() {
        clear_env();
        env::set_var("NODE_ID", "7");
        env::set_var("BIND_ADDR", "127.0.0.1:7000");
        env::set_var("CLIENT_ADDR", "127.0.0.1:7001");
        env::set_var("RAFTLOG_PATH", "/tmp/custom.db");
        let cfg = NodeConfig::from_env().unwrap();
        assert_eq!(cfg.log_path(), "/tmp/custom.db");
        clear_env();
    }
}
