//! Multi-node scenarios driven deterministically.
//!
//! A small in-process harness wires several `RaftNode` state machines
//! together through a message queue, with cuttable links. Timer firings
//! are invoked explicitly, so every interleaving here is reproducible.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use gavel_core::{Command, CommandKind, LogIndex, NodeId};
use gavel_raft::{CommitOutcome, CommitReceipt, Message, RaftConfig, RaftNode, RaftOutput, Role};

/// A cluster of nodes exchanging messages through an in-memory queue.
struct Cluster {
    nodes: BTreeMap<NodeId, RaftNode>,
    inflight: VecDeque<(NodeId, Message)>,
    cut: HashSet<(NodeId, NodeId)>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        let ids: Vec<NodeId> = (1..=size).map(NodeId::new).collect();
        let nodes = ids
            .iter()
            .map(|&id| (id, RaftNode::new(RaftConfig::new(id, ids.clone()))))
            .collect();
        Self {
            nodes,
            inflight: VecDeque::new(),
            cut: HashSet::new(),
        }
    }

    /// Cuts the link in both directions.
    fn isolate(&mut self, a: NodeId, b: NodeId) {
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    /// Restores the link in both directions.
    fn heal(&mut self, a: NodeId, b: NodeId) {
        self.cut.remove(&(a, b));
        self.cut.remove(&(b, a));
    }

    fn node(&self, id: u64) -> &RaftNode {
        &self.nodes[&NodeId::new(id)]
    }

    /// Queues the sends from a batch of outputs and resolves applier
    /// hand-offs the way the runtime would.
    fn collect(&mut self, from: NodeId, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::Send { to, message } => {
                    if !self.cut.contains(&(from, to)) {
                        self.inflight.push_back((to, message));
                    }
                }
                RaftOutput::Apply { index, notify, .. } => {
                    if let Some(notify) = notify {
                        notify.resolve(CommitOutcome::Applied {
                            index,
                            result: None,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    /// Delivers every queued message (and the messages those trigger).
    fn deliver_all(&mut self) {
        while let Some((to, message)) = self.inflight.pop_front() {
            let node = self.nodes.get_mut(&to).expect("unknown destination");
            let outputs = node.handle_message(message).expect("consensus fault");
            self.collect(to, outputs);
        }
    }

    /// Fires a node's leader timer.
    fn leader_timeout(&mut self, id: u64) {
        let id = NodeId::new(id);
        let outputs = self
            .nodes
            .get_mut(&id)
            .expect("unknown node")
            .handle_leader_timeout(Instant::now());
        self.collect(id, outputs);
    }

    /// Fires the leader's heartbeat timer for one peer.
    fn heartbeat(&mut self, id: u64, peer: u64) {
        let id = NodeId::new(id);
        let outputs = self
            .nodes
            .get_mut(&id)
            .expect("unknown node")
            .handle_heartbeat_timeout(NodeId::new(peer));
        self.collect(id, outputs);
    }

    /// Fires the leader's heartbeat timers for every other node.
    fn heartbeat_round(&mut self, id: u64) {
        let peers: Vec<u64> = self
            .nodes
            .keys()
            .map(|n| n.get())
            .filter(|&n| n != id)
            .collect();
        for peer in peers {
            self.heartbeat(id, peer);
        }
        self.deliver_all();
    }

    /// Submits a command on a node, panicking if it is not the leader.
    fn submit(&mut self, id: u64, kind: CommandKind, payload: &str) -> CommitReceipt {
        let id = NodeId::new(id);
        let (receipt, outputs) = self
            .nodes
            .get_mut(&id)
            .expect("unknown node")
            .submit(Command::new(kind, Bytes::from(payload.to_string())))
            .expect("submit on non-leader");
        self.collect(id, outputs);
        receipt
    }

    fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_leader())
            .map(RaftNode::node_id)
            .collect()
    }

    /// Asserts two nodes hold identical logs.
    fn assert_logs_match(&self, a: u64, b: u64) {
        let a = self.node(a);
        let b = self.node(b);
        assert_eq!(a.log().last_index(), b.log().last_index());
        for i in 1..=a.log().last_index().get() {
            let idx = LogIndex::new(i);
            assert_eq!(a.log().get(idx), b.log().get(idx), "logs differ at {idx}");
        }
    }
}

#[test]
fn bootstrap_election_elects_exactly_one_leader() {
    let mut cluster = Cluster::new(3);

    cluster.leader_timeout(1);
    cluster.deliver_all();

    assert_eq!(cluster.leaders(), vec![NodeId::new(1)]);
    for id in 1..=3 {
        assert_eq!(cluster.node(id).current_term(), cluster.node(1).current_term());
    }
    // The winner's announcement round told the others who leads.
    assert_eq!(cluster.node(2).leader_id(), Some(NodeId::new(1)));
    assert_eq!(cluster.node(3).leader_id(), Some(NodeId::new(1)));
}

#[test]
fn concurrent_candidates_yield_at_most_one_leader_per_term() {
    let mut cluster = Cluster::new(3);

    // Nodes 1 and 2 time out before any message is delivered.
    cluster.leader_timeout(1);
    cluster.leader_timeout(2);
    cluster.deliver_all();

    // Both campaigned in term 1; node 3's single vote decides it. At most
    // one of them may have won.
    let leaders = cluster.leaders();
    assert!(leaders.len() <= 1, "split vote elected {leaders:?}");
    if let [winner] = leaders[..] {
        for id in 1..=3 {
            let node = cluster.node(id);
            if node.node_id() != winner {
                assert_ne!(node.role(), Role::Leader);
            }
        }
    }
}

#[tokio::test]
async fn single_command_commits_everywhere() {
    let mut cluster = Cluster::new(3);
    cluster.leader_timeout(1);
    cluster.deliver_all();

    let receipt = cluster.submit(1, CommandKind::NewUser, r#"{"u":"x","p":"y"}"#);

    // One heartbeat round replicates and commits on the leader; the next
    // carries the commit index to the followers.
    cluster.heartbeat_round(1);
    assert_eq!(cluster.node(1).commit_index(), LogIndex::new(1));
    let outcome = receipt.wait().await;
    assert_eq!(
        outcome,
        CommitOutcome::Applied {
            index: LogIndex::new(1),
            result: None,
        }
    );

    cluster.heartbeat_round(1);
    for id in 1..=3 {
        assert_eq!(cluster.node(id).commit_index(), LogIndex::new(1), "node {id}");
        assert_eq!(cluster.node(id).last_applied(), LogIndex::new(1), "node {id}");
    }
    cluster.assert_logs_match(1, 2);
    cluster.assert_logs_match(1, 3);
}

#[test]
fn isolated_follower_catches_up() {
    let mut cluster = Cluster::new(3);

    // Node 2 is unreachable from the start; 1 and 3 elect and commit.
    cluster.isolate(NodeId::new(1), NodeId::new(2));
    cluster.leader_timeout(1);
    cluster.deliver_all();
    assert_eq!(cluster.leaders(), vec![NodeId::new(1)]);

    for i in 0..4 {
        let _ = cluster.submit(1, CommandKind::NewBid, &format!("bid-{i}"));
        cluster.heartbeat_round(1);
    }
    assert_eq!(cluster.node(1).commit_index(), LogIndex::new(4));
    assert_eq!(cluster.node(2).log().last_index(), LogIndex::NONE);

    // Reconnect. Node 2 never acknowledged anything, so the next probe
    // still starts at index 1 and carries the whole log.
    cluster.heal(NodeId::new(1), NodeId::new(2));
    for _ in 0..3 {
        cluster.heartbeat_round(1);
    }

    cluster.assert_logs_match(1, 2);
    assert_eq!(cluster.node(2).commit_index(), LogIndex::new(4));
    assert_eq!(cluster.node(2).last_applied(), LogIndex::new(4));
}

#[test]
fn leader_change_repairs_conflicting_tail() {
    let mut cluster = Cluster::new(3);

    // Node 1 leads term 1 and replicates one committed record.
    cluster.leader_timeout(1);
    cluster.deliver_all();
    let _ = cluster.submit(1, CommandKind::NewAuction, "lot-1");
    cluster.heartbeat_round(1);
    cluster.heartbeat_round(1);

    // Node 1 then appends two records nobody ever receives.
    cluster.isolate(NodeId::new(1), NodeId::new(2));
    cluster.isolate(NodeId::new(1), NodeId::new(3));
    let _ = cluster.submit(1, CommandKind::NewBid, "orphan-1");
    let _ = cluster.submit(1, CommandKind::NewBid, "orphan-2");
    assert_eq!(cluster.node(1).log().last_index(), LogIndex::new(3));

    // Node 2 wins term 2 with node 3's vote and appends its own record.
    cluster.leader_timeout(2);
    cluster.deliver_all();
    assert!(cluster.node(2).is_leader());
    let _ = cluster.submit(2, CommandKind::CloseAuction, "lot-1");
    cluster.heartbeat_round(2);

    // The old leader reconnects; replication truncates its orphaned tail.
    cluster.heal(NodeId::new(1), NodeId::new(2));
    cluster.heal(NodeId::new(1), NodeId::new(3));
    for _ in 0..6 {
        cluster.heartbeat_round(2);
    }

    assert_eq!(cluster.node(1).role(), Role::Follower);
    cluster.assert_logs_match(2, 1);
    cluster.assert_logs_match(2, 3);
    assert_eq!(cluster.node(1).commit_index(), LogIndex::new(2));
}

#[test]
fn deposed_leader_rejoins_as_follower() {
    let mut cluster = Cluster::new(3);
    cluster.leader_timeout(1);
    cluster.deliver_all();

    // The cluster moves on to term 2 while node 1 is cut off.
    cluster.isolate(NodeId::new(1), NodeId::new(2));
    cluster.isolate(NodeId::new(1), NodeId::new(3));
    cluster.leader_timeout(2);
    cluster.deliver_all();
    assert!(cluster.node(2).is_leader());
    assert!(cluster.node(1).is_leader(), "old leader cannot know yet");

    // First contact from the new leader deposes the old one.
    cluster.heal(NodeId::new(1), NodeId::new(2));
    cluster.heal(NodeId::new(1), NodeId::new(3));
    cluster.heartbeat_round(2);

    assert_eq!(cluster.node(1).role(), Role::Follower);
    assert_eq!(cluster.node(1).leader_id(), Some(NodeId::new(2)));
    assert_eq!(cluster.node(1).current_term(), cluster.node(2).current_term());
    assert_eq!(cluster.leaders(), vec![NodeId::new(2)]);
}
