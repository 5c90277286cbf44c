//! `raftkv` — a Raft-replicated command service fronting an in-process
//! key-value command interpreter.
//!
//! Clients submit mutating commands to any node; the leader serializes them
//! into a replicated log via [`openraft`], a majority acknowledges, and each
//! node applies committed entries to its local [`interpreter::Interpreter`]
//! in log order.

#[cfg(target_endian = "big")]
compile_error!("raftkv's on-disk log format is little-endian only; refusing to build on a big-endian host");

pub mod codec;
pub mod config;
pub mod errors;
pub mod grpc;
pub mod interpreter;
pub mod log;
pub mod metrics;
pub mod node;
pub mod raft_types;
pub mod registry;
pub mod request;
pub mod transport;

pub mod proto {
    tonic::include_proto!("raftkv");
}
