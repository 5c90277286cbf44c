//! Prometheus metrics for the consensus node, replacing the teacher's
//! HTTP-load-test scenario metrics with raft-relevant gauges/counters while
//! keeping the same `prometheus` + `lazy_static` + `hyper` serving pattern
//! (ambient concerns stay on the teacher's stack regardless of what
//! functionality moved — see DESIGN.md).

use std::env;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::{error, info};

use crate::node::RaftNode;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "raftkv".to_string());

    /// 1 when this node believes itself leader, 0 otherwise.
    pub static ref IS_LEADER: IntGauge =
        IntGauge::with_opts(
            Opts::new("is_leader", "Whether this node is currently the raft leader")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CURRENT_TERM: IntGauge =
        IntGauge::with_opts(
            Opts::new("current_term", "Current raft term observed by this node")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref LAST_LOG_INDEX: IntGauge =
        IntGauge::with_opts(
            Opts::new("last_log_index", "Index of the last log entry on this node")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref COMMIT_INDEX: IntGauge =
        IntGauge::with_opts(
            Opts::new("commit_index", "Index of the highest known committed entry")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref LAST_APPLIED_INDEX: IntGauge =
        IntGauge::with_opts(
            Opts::new("last_applied_index", "Index of the last entry applied to the state machine")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref VOTING_MEMBERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("voting_members", "Number of voting members in the current membership")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    /// Labeled by RPC kind ("append_entries", "vote", "install_snapshot")
    /// and outcome ("ok", "error"); incremented from `transport.rs`.
    pub static ref RPC_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_total", "Outbound consensus RPCs by kind and outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["rpc", "outcome"]
        ).unwrap();

    /// Labeled by "ok"/"error"; incremented from `request.rs`'s
    /// `handle_command`.
    pub static ref COMMANDS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("commands_total", "Client commands processed by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(IS_LEADER.clone()))?;
    registry.register(Box::new(CURRENT_TERM.clone()))?;
    registry.register(Box::new(LAST_LOG_INDEX.clone()))?;
    registry.register(Box::new(COMMIT_INDEX.clone()))?;
    registry.register(Box::new(LAST_APPLIED_INDEX.clone()))?;
    registry.register(Box::new(VOTING_MEMBERS.clone()))?;
    registry.register(Box::new(RPC_TOTAL.clone()))?;
    registry.register(Box::new(COMMANDS_TOTAL.clone()))?;
    Ok(())
}

/// Refreshes the gauges from `Raft::metrics()`'s current snapshot. Called on
/// every scrape rather than on a timer, since reading the watch channel is
/// cheap and a scrape is already a round trip.
fn refresh_from_node(node: &RaftNode) {
    let metrics = node.raft.metrics().borrow().clone();
    IS_LEADER.set((metrics.current_leader == Some(node.id)) as i64);
    CURRENT_TERM.set(metrics.current_term as i64);
    LAST_LOG_INDEX.set(metrics.last_log_index.unwrap_or(0) as i64);
    COMMIT_INDEX.set(metrics.last_applied.map(|l| l.index).unwrap_or(0) as i64);
    LAST_APPLIED_INDEX.set(metrics.last_applied.map(|l| l.index).unwrap_or(0) as i64);
    VOTING_MEMBERS.set(metrics.membership_config.membership().voter_ids().count() as i64);
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    node: Arc<RaftNode>,
) -> Result<Response<Body>, hyper::Error> {
    refresh_from_node(&node);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(addr: std::net::SocketAddr, node: Arc<RaftNode>) {
    let make_svc = make_service_fn(move |_conn| {
        let node = node.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let node = node.clone();
                async move { metrics_handler(req, node).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, used by tests and the `INFO`
/// command's diagnostics.
pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "metrics encoded non-utf8");
        String::from("# error encoding metrics")
    })
}
