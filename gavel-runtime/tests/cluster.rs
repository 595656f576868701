//! End-to-end cluster tests over real localhost TCP.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use gavel_core::{CommandKind, LogIndex, NodeId};
use gavel_raft::{CommitOutcome, Role};
use gavel_runtime::backend::BackendResult;
use gavel_runtime::{start_node, CommandBackend, NodeConfig, NodeHandle, ServerError, TimingConfig};

/// Records every applied command.
#[derive(Default)]
struct CountingBackend {
    applied: Mutex<Vec<(CommandKind, Bytes)>>,
}

#[async_trait]
impl CommandBackend for CountingBackend {
    async fn apply(&self, kind: CommandKind, payload: Bytes) -> BackendResult {
        self.applied.lock().unwrap().push((kind, payload));
        Ok(None)
    }
}

struct TestNode {
    handle: NodeHandle,
    backend: Arc<CountingBackend>,
}

/// Starts a three-node cluster on consecutive localhost ports.
async fn start_cluster(base_port: u16) -> Vec<TestNode> {
    let addr = |id: u64| format!("127.0.0.1:{}", base_port + u16::try_from(id).unwrap());
    let mut nodes = Vec::new();

    for id in 1..=3u64 {
        let mut config = NodeConfig::new(
            NodeId::new(id),
            addr(id).parse().unwrap(),
            format!("127.0.0.1:{}", base_port + 100 + u16::try_from(id).unwrap())
                .parse()
                .unwrap(),
        )
        .with_timing(TimingConfig::fast_for_testing());
        for peer in (1..=3u64).filter(|&p| p != id) {
            config = config.with_peer(NodeId::new(peer), addr(peer));
        }

        let backend = Arc::new(CountingBackend::default());
        let (handle, events) = start_node(&config, Arc::clone(&backend) as _)
            .await
            .expect("node failed to start");
        // Router notifications are not under test here.
        drop(events);

        nodes.push(TestNode { handle, backend });
    }

    nodes
}

/// Polls until exactly one node is leader and returns its index.
async fn wait_for_leader(nodes: &[TestNode]) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut leaders = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Ok(status) = node.handle.status().await {
                if status.role == Role::Leader {
                    leaders.push(i);
                }
            }
        }
        if leaders.len() == 1 {
            return leaders[0];
        }
        assert!(Instant::now() < deadline, "no unique leader within timeout");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until `check` passes on every node.
async fn wait_for_all(nodes: &[TestNode], what: &str, check: impl Fn(&TestNode) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if nodes.iter().all(&check) {
            return;
        }
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn shutdown(nodes: Vec<TestNode>) {
    for node in nodes {
        let _ = node.handle.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_elects_one_leader_with_agreed_term() {
    let nodes = start_cluster(19600).await;

    let leader = wait_for_leader(&nodes).await;
    let leader_status = nodes[leader].handle.status().await.unwrap();

    // Every node settles on the winner's term and identity.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut settled = true;
        for node in &nodes {
            let status = node.handle.status().await.unwrap();
            if status.term != leader_status.term
                || status.leader_id != Some(leader_status.node_id)
            {
                settled = false;
            }
        }
        if settled {
            break;
        }
        assert!(Instant::now() < deadline, "cluster never agreed on the leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown(nodes).await;
}

#[tokio::test]
async fn submitted_command_commits_on_every_node() {
    let nodes = start_cluster(19700).await;
    let leader = wait_for_leader(&nodes).await;

    let payload = Bytes::from(r#"{"u":"x","p":"y"}"#);
    let receipt = nodes[leader]
        .handle
        .submit(CommandKind::NewUser, payload.clone())
        .await
        .expect("leader must accept the submission");

    let outcome = tokio::time::timeout(Duration::from_secs(5), receipt.wait())
        .await
        .expect("commit timed out");
    assert_eq!(
        outcome,
        CommitOutcome::Applied {
            index: LogIndex::new(1),
            result: None,
        }
    );

    // The commit point reaches every node.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut all_committed = true;
        for node in &nodes {
            let status = node.handle.status().await.unwrap();
            if status.commit_index < LogIndex::new(1) || status.last_applied < LogIndex::new(1) {
                all_committed = false;
            }
        }
        if all_committed {
            break;
        }
        assert!(Instant::now() < deadline, "commit never reached all nodes");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Each state machine saw the command exactly once.
    wait_for_all(&nodes, "apply on all backends", |node| {
        node.backend.applied.lock().unwrap().len() == 1
    })
    .await;
    for node in &nodes {
        let applied = node.backend.applied.lock().unwrap();
        assert_eq!(applied.as_slice(), &[(CommandKind::NewUser, payload.clone())]);
    }

    shutdown(nodes).await;
}

#[tokio::test]
async fn follower_rejects_submission_with_leader_hint() {
    let nodes = start_cluster(19800).await;
    let leader = wait_for_leader(&nodes).await;
    let follower = (0..nodes.len()).find(|&i| i != leader).unwrap();

    // Wait until the follower knows who leads.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = nodes[follower].handle.status().await.unwrap();
        if status.leader_id.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "follower never learned the leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let result = nodes[follower]
        .handle
        .submit(CommandKind::NewBid, Bytes::from("100"))
        .await;
    match result {
        Err(ServerError::NotLeader(err)) => {
            let leader_id = nodes[leader].handle.status().await.unwrap().node_id;
            assert_eq!(
                err,
                gavel_raft::SubmitError::NotLeader {
                    hint: Some(leader_id)
                }
            );
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }

    shutdown(nodes).await;
}
