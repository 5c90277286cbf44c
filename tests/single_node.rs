//! End-to-end exercise of bootstrap + the request queue against a
//! single-node cluster: no gRPC sockets involved, just `node::bootstrap`
//! and `RequestQueue::submit` the way `grpc.rs`'s handlers use them.

use std::sync::Arc;
use std::time::Duration;

use raftkv::config::NodeConfig;
use raftkv::interpreter::{Interpreter, KvInterpreter};
use raftkv::node;
use raftkv::request::Request;

fn cfg(id: u64, base_port: u16, path: String) -> NodeConfig {
    NodeConfig {
        id,
        bind_addr: format!("127.0.0.1:{base_port}").parse().unwrap(),
        client_addr: format!("127.0.0.1:{}", base_port + 1).parse().unwrap(),
        metrics_addr: format!("127.0.0.1:{}", base_port + 2).parse().unwrap(),
        init: true,
        join: false,
        join_addr: None,
        raftlog_path: Some(path),
    }
}

async fn wait_for_leader(node: &raftkv::node::RaftNode) {
    for _ in 0..100 {
        if node.is_leader() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node never became leader");
}

#[tokio::test]
async fn single_node_set_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db").to_string_lossy().into_owned();
    let interpreter: Arc<dyn Interpreter> = Arc::new(KvInterpreter::new());

    let (node, queue) = node::bootstrap(&cfg(1, 17100, path), interpreter)
        .await
        .unwrap();
    wait_for_leader(&node).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Command {
        argv: vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()],
        reply: tx,
    });
    let resp = rx.await.unwrap().unwrap();
    assert!(resp.ok);

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Command {
        argv: vec![b"GET".to_vec(), b"k".to_vec()],
        reply: tx,
    });
    let resp = rx.await.unwrap().unwrap();
    assert!(resp.ok);
    assert_eq!(resp.value, b"v");
}

#[tokio::test]
async fn single_node_get_missing_key_is_an_error_reply_not_a_channel_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db").to_string_lossy().into_owned();
    let interpreter: Arc<dyn Interpreter> = Arc::new(KvInterpreter::new());

    let (node, queue) = node::bootstrap(&cfg(1, 17110, path), interpreter)
        .await
        .unwrap();
    wait_for_leader(&node).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Command {
        argv: vec![b"GET".to_vec(), b"missing".to_vec()],
        reply: tx,
    });
    let resp = rx.await.unwrap().unwrap();
    assert!(!resp.ok);
}

#[tokio::test]
async fn info_report_names_self_as_leader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db").to_string_lossy().into_owned();
    let interpreter: Arc<dyn Interpreter> = Arc::new(KvInterpreter::new());

    let (node, queue) = node::bootstrap(&cfg(1, 17120, path), interpreter)
        .await
        .unwrap();
    wait_for_leader(&node).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Info { reply: tx });
    let report = rx.await.unwrap();
    assert!(report.contains("node_id:1"));
    assert!(report.contains("role:leader"));
    assert!(report.contains("leader_id:1"));
    assert!(report.contains("log_entries:"));
    assert!(report.contains("commit_index:"));
}

/// §4.4's `handleInfo` reports a distinct entries count and sources
/// `commit_index` from the log's own committed entry, not from
/// `last_applied` — a SET bumps both but they must not be aliased together.
#[tokio::test]
async fn info_report_tracks_commit_index_and_entry_count_as_commands_apply() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db").to_string_lossy().into_owned();
    let interpreter: Arc<dyn Interpreter> = Arc::new(KvInterpreter::new());

    let (node, queue) = node::bootstrap(&cfg(1, 17130, path), interpreter)
        .await
        .unwrap();
    wait_for_leader(&node).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Info { reply: tx });
    let before = rx.await.unwrap();
    assert!(before.contains("log_entries:0") || before.contains("log_entries:1"));

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Command {
        argv: vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()],
        reply: tx,
    });
    rx.await.unwrap().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.submit(Request::Info { reply: tx });
    let after = rx.await.unwrap();
    assert!(!after.contains("log_entries:0"), "entries count must advance: {after}");
    assert!(!after.contains("commit_index:0"), "commit index must advance: {after}");
}
