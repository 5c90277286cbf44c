//! `raftkv` node binary: loads configuration, bootstraps the consensus task
//! (init/join/recover), and serves the consensus, command, and metrics
//! endpoints until the node is told to shut down.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use raftkv::config::NodeConfig;
use raftkv::grpc::{CommandServiceImpl, ConsensusServiceImpl};
use raftkv::interpreter::KvInterpreter;
use raftkv::metrics::{register_metrics, start_metrics_server};
use raftkv::node;
use raftkv::proto::command_service_server::CommandServiceServer;
use raftkv::proto::consensus_service_server::ConsensusServiceServer;
use tokio::time::sleep;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cfg = NodeConfig::from_env()?;
    info!(node_id = cfg.id, bind = %cfg.bind_addr, client = %cfg.client_addr, "starting raftkv node");

    if let Err(e) = register_metrics() {
        error!(error = %e, "failed to register metrics, continuing without them");
    }

    let interpreter: Arc<dyn raftkv::interpreter::Interpreter> = Arc::new(KvInterpreter::new());
    let (rnode, queue) = node::bootstrap(&cfg, interpreter).await?;

    let consensus_addr = cfg.bind_addr;
    let consensus_server = {
        let rnode = rnode.clone();
        tokio::spawn(async move {
            let svc = ConsensusServiceImpl { node: rnode };
            if let Err(e) = Server::builder()
                .add_service(ConsensusServiceServer::new(svc))
                .serve(consensus_addr)
                .await
            {
                error!(error = %e, "consensus gRPC server exited");
            }
        })
    };

    let client_addr = cfg.client_addr;
    let command_server = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let svc = CommandServiceImpl { queue };
            if let Err(e) = Server::builder()
                .add_service(CommandServiceServer::new(svc))
                .serve(client_addr)
                .await
            {
                error!(error = %e, "command gRPC server exited");
            }
        })
    };

    let metrics_server = {
        let rnode = rnode.clone();
        let addr = cfg.metrics_addr;
        tokio::spawn(async move {
            start_metrics_server(addr, rnode).await;
        })
    };

    // Poll the shared running flag; `PersistentLog::apply_to_state_machine`
    // clears it when a committed entry removes this node (spec.md §7).
    while rnode.running.load(Ordering::SeqCst) {
        sleep(Duration::from_millis(200)).await;
    }
    info!(node_id = cfg.id, "node removed from cluster or shutting down, exiting");

    consensus_server.abort();
    command_server.abort();
    metrics_server.abort();

    Ok(())
}
